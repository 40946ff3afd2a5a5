//! Result URL validation: before a job is declared succeeded, at least one
//! result URL must serve non-empty bytes of a content type compatible with
//! the declared media kind (and never `text/html`).

use async_trait::async_trait;
use domain_catalog::MediaKind;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GenerationError, GenerationResult};

fn content_type_matches(media_type: Option<MediaKind>, content_type: &str) -> bool {
    if content_type.is_empty() {
        return true;
    }
    if content_type.starts_with("text/html") {
        return false;
    }
    match media_type {
        None => true,
        Some(MediaKind::Image) => content_type.starts_with("image/"),
        Some(MediaKind::Video) => content_type.starts_with("video/"),
        Some(MediaKind::Audio) => content_type.starts_with("audio/"),
        Some(MediaKind::Text) => content_type.starts_with("text/"),
        Some(MediaKind::Document) => true,
    }
}

/// Probe each URL with a GET and accept the set once one yields non-empty,
/// type-compatible bytes.
pub async fn validate_result_urls(
    http: &reqwest::Client,
    urls: &[String],
    media_type: Option<MediaKind>,
    correlation_id: &str,
) -> GenerationResult<()> {
    if urls.is_empty() {
        return Err(GenerationError::ResultParse {
            code: "KIE_RESULT_EMPTY",
            fix_hint: "Empty result URL list.".to_string(),
        });
    }

    let mut last_error: Option<String> = None;
    for url in urls {
        let response = match http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                last_error = Some(e.to_string());
                continue;
            }
        };
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let content_length = response.content_length();

        let mut response = response;
        let sample = match response.chunk().await {
            Ok(Some(bytes)) => bytes.len(),
            Ok(None) => 0,
            Err(e) => {
                last_error = Some(e.to_string());
                continue;
            }
        };
        if content_length.unwrap_or(sample as u64) == 0 && sample == 0 {
            last_error = Some("empty_payload".to_string());
            continue;
        }

        let effective_media = media_type.or_else(|| MediaKind::from_url_extension(url));
        if !content_type_matches(effective_media, &content_type) {
            last_error = Some(format!("unexpected_content_type:{content_type}"));
            continue;
        }

        info!(
            action = "KIE_VALIDATE",
            correlation_id = %correlation_id,
            content_type = %content_type,
            "result URL validated"
        );
        return Ok(());
    }

    let hint = last_error.unwrap_or_else(|| "Result URL validation failed.".to_string());
    warn!(
        action = "KIE_VALIDATE",
        correlation_id = %correlation_id,
        error_code = "KIE_RESULT_INVALID_CONTENT",
        fix_hint = %hint,
        "no result URL passed validation"
    );
    Err(GenerationError::ResultParse {
        code: "KIE_RESULT_INVALID_CONTENT",
        fix_hint: hint,
    })
}

/// Pluggable validation seam; the engine and the pending reconciler go
/// through this trait so tests can bypass the network.
#[async_trait]
pub trait ResultValidator: Send + Sync {
    async fn validate(
        &self,
        urls: &[String],
        media_type: Option<MediaKind>,
        correlation_id: &str,
    ) -> GenerationResult<()>;
}

/// Production validator backed by a shared reqwest client.
pub struct HttpResultValidator {
    http: reqwest::Client,
}

impl HttpResultValidator {
    pub fn new(probe_timeout: Duration) -> GenerationResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|e| GenerationError::ResultParse {
                code: "INTERNAL_EXCEPTION",
                fix_hint: format!("failed to build probe client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ResultValidator for HttpResultValidator {
    async fn validate(
        &self,
        urls: &[String],
        media_type: Option<MediaKind>,
        correlation_id: &str,
    ) -> GenerationResult<()> {
        validate_result_urls(&self.http, urls, media_type, correlation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_never_matches() {
        assert!(!content_type_matches(None, "text/html"));
        assert!(!content_type_matches(Some(MediaKind::Document), "text/html; charset=utf-8".split(';').next().unwrap()));
    }

    #[test]
    fn test_media_kind_prefix_matching() {
        assert!(content_type_matches(Some(MediaKind::Image), "image/png"));
        assert!(!content_type_matches(Some(MediaKind::Image), "video/mp4"));
        assert!(content_type_matches(Some(MediaKind::Video), "video/webm"));
        assert!(content_type_matches(Some(MediaKind::Audio), "audio/mpeg"));
        assert!(content_type_matches(Some(MediaKind::Text), "text/plain"));
        assert!(content_type_matches(Some(MediaKind::Document), "application/pdf"));
    }

    #[test]
    fn test_unknown_content_type_is_permissive() {
        assert!(content_type_matches(Some(MediaKind::Image), ""));
        assert!(content_type_matches(None, "application/octet-stream"));
    }

    #[tokio::test]
    async fn test_empty_url_list_rejected() {
        let http = reqwest::Client::new();
        let err = validate_result_urls(&http, &[], Some(MediaKind::Image), "corr")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "KIE_RESULT_EMPTY");
    }
}
