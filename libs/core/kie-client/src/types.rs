//! Wire types for the provider API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized provider task state.
///
/// The wire carries a zoo of case-insensitive spellings; everything funnels
/// through [`ProviderState::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Unknown,
}

impl ProviderState {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Unknown;
        };
        match raw.to_lowercase().as_str() {
            "success" | "completed" | "succeeded" => Self::Succeeded,
            "failed" | "fail" | "error" => Self::Failed,
            "cancel" | "cancelled" | "canceled" => Self::Canceled,
            "pending" | "queued" | "waiting" | "queuing" => Self::Queued,
            "processing" | "running" | "generating" => Self::Running,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Successful task creation.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub correlation_id: String,
}

/// One `recordInfo` snapshot of a provider task.
#[derive(Debug, Clone, Default)]
pub struct TaskRecord {
    pub task_id: String,
    /// Raw state string as returned by the provider
    pub state_raw: Option<String>,
    pub state: ProviderState,
    /// JSON-encoded result payload (the provider double-encodes it)
    pub result_json: Option<String>,
    pub result_urls: Vec<String>,
    pub result_text: Option<String>,
    pub fail_code: Option<String>,
    pub fail_msg: Option<String>,
    pub error_message: Option<String>,
    pub complete_time: Option<String>,
    pub create_time: Option<String>,
    pub correlation_id: String,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl TaskRecord {
    /// Build from the provider's `data.data` payload.
    pub fn from_payload(task_id: &str, payload: &Value, correlation_id: &str) -> Self {
        let state_raw = payload
            .get("state")
            .and_then(Value::as_str)
            .map(str::to_string);
        let result_urls = payload
            .get("resultUrls")
            .and_then(Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            task_id: payload
                .get("taskId")
                .and_then(Value::as_str)
                .unwrap_or(task_id)
                .to_string(),
            state: ProviderState::parse(state_raw.as_deref()),
            state_raw,
            result_json: payload
                .get("resultJson")
                .and_then(Value::as_str)
                .map(str::to_string),
            result_urls,
            result_text: payload
                .get("resultText")
                .and_then(Value::as_str)
                .map(str::to_string),
            fail_code: payload
                .get("failCode")
                .and_then(Value::as_str)
                .map(str::to_string),
            fail_msg: payload
                .get("failMsg")
                .and_then(Value::as_str)
                .map(str::to_string),
            error_message: payload
                .get("errorMessage")
                .and_then(Value::as_str)
                .map(str::to_string),
            complete_time: payload
                .get("completeTime")
                .and_then(Value::as_str)
                .map(str::to_string),
            create_time: payload
                .get("createTime")
                .and_then(Value::as_str)
                .map(str::to_string),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// The failure message to surface, preferring `failMsg`.
    pub fn failure_message(&self) -> Option<&str> {
        self.fail_msg
            .as_deref()
            .or(self.error_message.as_deref())
    }

    /// Convert back into the raw record shape consumed by the normalizer.
    pub fn to_raw(&self) -> Value {
        let mut record = serde_json::Map::new();
        record.insert("taskId".into(), Value::String(self.task_id.clone()));
        if let Some(state) = &self.state_raw {
            record.insert("state".into(), Value::String(state.clone()));
        }
        if let Some(result_json) = &self.result_json {
            record.insert("resultJson".into(), Value::String(result_json.clone()));
        }
        if !self.result_urls.is_empty() {
            record.insert(
                "resultUrls".into(),
                Value::Array(
                    self.result_urls
                        .iter()
                        .map(|url| Value::String(url.clone()))
                        .collect(),
                ),
            );
        }
        if let Some(text) = &self.result_text {
            record.insert("resultText".into(), Value::String(text.clone()));
        }
        if let Some(code) = &self.fail_code {
            record.insert("failCode".into(), Value::String(code.clone()));
        }
        if let Some(msg) = &self.fail_msg {
            record.insert("failMsg".into(), Value::String(msg.clone()));
        }
        Value::Object(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_parsing_case_insensitive() {
        assert_eq!(ProviderState::parse(Some("SUCCESS")), ProviderState::Succeeded);
        assert_eq!(ProviderState::parse(Some("Queuing")), ProviderState::Queued);
        assert_eq!(ProviderState::parse(Some("GENERATING")), ProviderState::Running);
        assert_eq!(ProviderState::parse(Some("cancelled")), ProviderState::Canceled);
        assert_eq!(ProviderState::parse(Some("fail")), ProviderState::Failed);
        assert_eq!(ProviderState::parse(Some("whatever")), ProviderState::Unknown);
        assert_eq!(ProviderState::parse(None), ProviderState::Unknown);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProviderState::Succeeded.is_terminal());
        assert!(ProviderState::Failed.is_terminal());
        assert!(ProviderState::Canceled.is_terminal());
        assert!(!ProviderState::Queued.is_terminal());
        assert!(!ProviderState::Running.is_terminal());
        assert!(!ProviderState::Unknown.is_terminal());
    }

    #[test]
    fn test_record_from_payload() {
        let payload = json!({
            "taskId": "t-9",
            "state": "success",
            "resultUrls": ["https://cdn.example.com/a.png"],
            "resultJson": "{\"resultUrls\":[\"https://cdn.example.com/a.png\"]}",
            "completeTime": "2024-01-01T00:00:00Z",
        });
        let record = TaskRecord::from_payload("t-9", &payload, "corr");
        assert_eq!(record.task_id, "t-9");
        assert_eq!(record.state, ProviderState::Succeeded);
        assert_eq!(record.result_urls.len(), 1);
        assert!(record.result_json.is_some());
        assert_eq!(record.failure_message(), None);
    }

    #[test]
    fn test_failure_message_prefers_fail_msg() {
        let payload = json!({
            "taskId": "t-1",
            "state": "failed",
            "failCode": "422",
            "failMsg": "bad input",
            "errorMessage": "other",
        });
        let record = TaskRecord::from_payload("t-1", &payload, "corr");
        assert_eq!(record.failure_message(), Some("bad input"));
    }

    #[test]
    fn test_to_raw_round_trips_fields() {
        let payload = json!({
            "taskId": "t-2",
            "state": "success",
            "resultUrls": ["https://cdn.example.com/x.mp4"],
        });
        let record = TaskRecord::from_payload("t-2", &payload, "corr");
        let raw = record.to_raw();
        assert_eq!(raw["taskId"], "t-2");
        assert_eq!(raw["state"], "success");
        assert_eq!(raw["resultUrls"][0], "https://cdn.example.com/x.mp4");
    }
}
