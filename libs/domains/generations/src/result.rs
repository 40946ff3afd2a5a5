//! Provider record parsing and media classification.

use domain_catalog::MediaKind;
use kie_client::ProviderState;
use serde_json::Value;
use tracing::{error, info};

use crate::error::{GenerationError, GenerationResult};
use crate::urls::{normalize_result_urls, UrlContext};

/// Typed outcome of a finished generation.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub task_id: String,
    pub state: ProviderState,
    pub media_type: MediaKind,
    pub urls: Vec<String>,
    pub text: Option<String>,
    pub raw: Value,
}

/// The provider double-encodes `resultJson`; tolerate strings, objects, and
/// garbage alike.
fn parse_result_json(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(encoded)) => {
            serde_json::from_str(encoded).unwrap_or_else(|_| Value::Object(Default::default()))
        }
        _ => Value::Object(Default::default()),
    }
}

fn push_urls(target: &mut Vec<String>, value: Option<&Value>) {
    match value {
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(url) = item.as_str() {
                    if !url.is_empty() {
                        target.push(url.to_string());
                    }
                }
            }
        }
        Some(Value::String(url)) if !url.is_empty() => target.push(url.clone()),
        _ => {}
    }
}

/// Merge `resultUrls`/`resultUrl` from the record and the embedded JSON into
/// one ordered, deduplicated list.
fn extract_urls(record: &Value, result_json: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    push_urls(
        &mut urls,
        record.get("resultUrls").or_else(|| record.get("resultUrl")),
    );
    push_urls(
        &mut urls,
        result_json
            .get("resultUrls")
            .or_else(|| result_json.get("resultUrl"))
            .or_else(|| result_json.get("urls")),
    );
    let mut seen = std::collections::HashSet::new();
    urls.retain(|url| seen.insert(url.clone()));
    urls
}

fn extract_text(record: &Value, result_json: &Value) -> Option<String> {
    let value = record
        .get("resultText")
        .filter(|v| !v.is_null())
        .or_else(|| result_json.get("resultText").filter(|v| !v.is_null()))
        .or_else(|| result_json.get("resultObject").filter(|v| !v.is_null()))
        .or_else(|| result_json.get("text").filter(|v| !v.is_null()))?;
    match value {
        Value::String(text) => Some(text.clone()),
        other => serde_json::to_string_pretty(other).ok(),
    }
}

fn extract_media_hint(record: &Value, result_json: &Value) -> Option<MediaKind> {
    for source in [result_json, record] {
        for key in ["mediaType", "outputType", "output_type", "type"] {
            if let Some(raw) = source.get(key).and_then(Value::as_str) {
                if let Some(kind) = MediaKind::from_hint(raw) {
                    return Some(kind);
                }
            }
        }
    }
    None
}

fn infer_media_from_urls(urls: &[String], fallback: MediaKind) -> MediaKind {
    urls.iter()
        .find_map(|url| MediaKind::from_url_extension(url))
        .unwrap_or(fallback)
}

/// Parse one terminal provider record into a [`JobResult`].
///
/// Classification: explicit hint, then URL extension, then the model's
/// declared output kind; text-only results classify as text.
pub fn parse_record_info(
    record: &Value,
    declared_media: MediaKind,
    model_id: &str,
    ctx: &UrlContext<'_>,
) -> GenerationResult<JobResult> {
    let result_json = parse_result_json(record.get("resultJson"));
    let mut urls = extract_urls(record, &result_json);
    if !urls.is_empty() {
        urls = normalize_result_urls(&urls, ctx)?;
    }
    let text = extract_text(record, &result_json);

    let hint = extract_media_hint(record, &result_json);

    let media_type = if text.is_some() && urls.is_empty() {
        MediaKind::Text
    } else if !urls.is_empty() {
        let fallback = match hint.unwrap_or(declared_media) {
            MediaKind::Text => MediaKind::Document,
            kind => kind,
        };
        infer_media_from_urls(&urls, fallback)
    } else {
        let record_keys: Vec<&str> = record
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();
        error!(
            action = "KIE_PARSE",
            model_id = %model_id,
            task_id = record.get("taskId").and_then(serde_json::Value::as_str).unwrap_or("-"),
            state = record.get("state").and_then(serde_json::Value::as_str).unwrap_or("-"),
            fail_code = record.get("failCode").and_then(serde_json::Value::as_str).unwrap_or("-"),
            record_keys = ?record_keys,
            error_code = "KIE_RESULT_EMPTY",
            "provider returned a terminal record with no result"
        );
        return Err(GenerationError::ResultParse {
            code: "KIE_RESULT_EMPTY",
            fix_hint: "Check KIE recordInfo/resultJson for this task.".to_string(),
        });
    };

    if media_type == MediaKind::Text && text.as_deref().is_none_or(str::is_empty) {
        return Err(GenerationError::ResultParse {
            code: "KIE_RESULT_EMPTY_TEXT",
            fix_hint: "Text result carried no text payload.".to_string(),
        });
    }

    let result = JobResult {
        task_id: record
            .get("taskId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        state: ProviderState::parse(record.get("state").and_then(Value::as_str)),
        media_type,
        urls,
        text,
        raw: record.clone(),
    };
    info!(
        action = "KIE_PARSE",
        model_id = %model_id,
        task_id = %result.task_id,
        media_type = %result.media_type,
        urls = result.urls.len(),
        "provider record parsed"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> UrlContext<'static> {
        UrlContext::default()
    }

    #[test]
    fn test_happy_path_image() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultUrls": ["https://cdn/img.png"],
        });
        let result = parse_record_info(&record, MediaKind::Image, "flux", &ctx()).unwrap();
        assert_eq!(result.media_type, MediaKind::Image);
        assert_eq!(result.urls, vec!["https://cdn/img.png"]);
        assert_eq!(result.state, ProviderState::Succeeded);
    }

    #[test]
    fn test_urls_merged_and_deduplicated() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultUrls": ["https://cdn/a.png"],
            "resultJson": "{\"resultUrls\":[\"https://cdn/a.png\",\"https://cdn/b.png\"]}",
        });
        let result = parse_record_info(&record, MediaKind::Image, "m", &ctx()).unwrap();
        assert_eq!(result.urls, vec!["https://cdn/a.png", "https://cdn/b.png"]);
    }

    #[test]
    fn test_single_result_url_string() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultUrl": "https://cdn/only.mp4",
        });
        let result = parse_record_info(&record, MediaKind::Video, "m", &ctx()).unwrap();
        assert_eq!(result.urls.len(), 1);
        assert_eq!(result.media_type, MediaKind::Video);
    }

    #[test]
    fn test_text_only_result() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultJson": "{\"resultText\":\"hello\"}",
        });
        let result = parse_record_info(&record, MediaKind::Text, "m", &ctx()).unwrap();
        assert_eq!(result.media_type, MediaKind::Text);
        assert_eq!(result.text.as_deref(), Some("hello"));
        assert!(result.urls.is_empty());
    }

    #[test]
    fn test_non_string_text_json_encoded() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultJson": "{\"resultObject\":{\"answer\":42}}",
        });
        let result = parse_record_info(&record, MediaKind::Text, "m", &ctx()).unwrap();
        assert!(result.text.unwrap().contains("42"));
    }

    #[test]
    fn test_media_hint_overrides_declared() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "mediaType": "video",
            "resultUrls": ["https://cdn/file.bin"],
        });
        let result = parse_record_info(&record, MediaKind::Image, "m", &ctx()).unwrap();
        assert_eq!(result.media_type, MediaKind::Video);
    }

    #[test]
    fn test_extension_beats_declared_kind() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultUrls": ["https://cdn/actually.mp3"],
        });
        let result = parse_record_info(&record, MediaKind::Image, "m", &ctx()).unwrap();
        assert_eq!(result.media_type, MediaKind::Audio);
    }

    #[test]
    fn test_unknown_extension_falls_back_to_document_for_text_hint() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultUrls": ["https://cdn/data.bin"],
        });
        let result = parse_record_info(&record, MediaKind::Text, "m", &ctx()).unwrap();
        assert_eq!(result.media_type, MediaKind::Document);
    }

    #[test]
    fn test_empty_result_raises() {
        let record = json!({"taskId": "t1", "state": "success"});
        let err = parse_record_info(&record, MediaKind::Image, "m", &ctx()).unwrap_err();
        assert_eq!(err.error_code(), "KIE_RESULT_EMPTY");
    }

    #[test]
    fn test_empty_text_raises() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultJson": "{\"resultText\":\"\"}",
        });
        let err = parse_record_info(&record, MediaKind::Text, "m", &ctx()).unwrap_err();
        assert_eq!(err.error_code(), "KIE_RESULT_EMPTY_TEXT");
    }

    #[test]
    fn test_invalid_url_raises() {
        let record = json!({
            "taskId": "t1",
            "state": "success",
            "resultUrls": ["not a url"],
        });
        let err = parse_record_info(&record, MediaKind::Image, "m", &ctx()).unwrap_err();
        assert_eq!(err.error_code(), "KIE_RESULT_URL_INVALID");
    }

    #[test]
    fn test_classification_total_for_nonempty_results() {
        // Every non-empty result classifies into exactly one kind.
        let records = [
            json!({"taskId": "t", "state": "success", "resultUrls": ["https://c/x.png"]}),
            json!({"taskId": "t", "state": "success", "resultUrls": ["https://c/x.webm"]}),
            json!({"taskId": "t", "state": "success", "resultUrls": ["https://c/x.ogg"]}),
            json!({"taskId": "t", "state": "success", "resultUrls": ["https://c/x.dat"]}),
            json!({"taskId": "t", "state": "success", "resultJson": "{\"text\":\"hi\"}"}),
        ];
        let expected = [
            MediaKind::Image,
            MediaKind::Video,
            MediaKind::Audio,
            MediaKind::Document,
            MediaKind::Text,
        ];
        for (record, want) in records.iter().zip(expected) {
            let got = parse_record_info(record, MediaKind::Document, "m", &ctx()).unwrap();
            assert_eq!(got.media_type, want);
        }
    }
}
