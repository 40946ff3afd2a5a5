use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of a generation job.
///
/// Terminal states never transition; `timeout` is non-terminal and is
/// re-entered by the pending reconciler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Timeout,
    Completed,
    Delivered,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Canceled)
    }

    /// Statuses swept by the pending reconciler.
    pub fn pending_states() -> &'static [JobStatus] {
        &[Self::Created, Self::Queued, Self::Running, Self::Timeout]
    }
}

/// Persisted job row, owned by the job engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub request_id: Option<String>,
    pub user_id: i64,
    pub model_id: String,
    pub prompt_fingerprint: Option<String>,
    #[serde(default)]
    pub params: Value,
    pub provider_task_id: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub result_urls: Vec<String>,
    pub result_text: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub price: Decimal,
    pub sku_id: Option<String>,
    #[serde(default)]
    pub free: bool,
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(user_id: i64, model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::now_v7().to_string(),
            request_id: None,
            user_id,
            model_id: model_id.into(),
            prompt_fingerprint: None,
            params: Value::Null,
            provider_task_id: None,
            status: JobStatus::Created,
            result_urls: Vec::new(),
            result_text: None,
            error_code: None,
            error_message: None,
            price: Decimal::ZERO,
            sku_id: None,
            free: false,
            prompt: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied on a status transition.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub provider_task_id: Option<String>,
    pub result_urls: Option<Vec<String>>,
    pub result_text: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    pub fn with_task_id(task_id: impl Into<String>) -> Self {
        Self {
            provider_task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    pub fn with_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_result_urls(urls: Vec<String>) -> Self {
        Self {
            result_urls: Some(urls),
            ..Self::default()
        }
    }

    /// Apply onto a job record. The provider task id is never cleared once
    /// set; terminal statuses never transition.
    pub fn apply(self, job: &mut JobRecord, status: JobStatus) -> bool {
        if job.status.is_terminal() && job.status != status {
            tracing::warn!(
                job_id = %job.job_id,
                current = %job.status,
                requested = %status,
                "Ignoring status transition out of terminal state"
            );
            return false;
        }
        job.status = status;
        if let Some(task_id) = self.provider_task_id {
            if job.provider_task_id.is_none() {
                job.provider_task_id = Some(task_id);
            }
        }
        if let Some(urls) = self.result_urls {
            job.result_urls = urls;
        }
        if let Some(text) = self.result_text {
            job.result_text = Some(text);
        }
        if let Some(code) = self.error_code {
            job.error_code = Some(code);
        }
        if let Some(message) = self.error_message {
            job.error_message = Some(message);
        }
        job.updated_at = Utc::now();
        true
    }
}

/// Delivery record state; at most one `delivered_at` per key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryState {
    Delivering,
    Delivered,
    Failed,
}

/// Hourly free-tier window; both fields reset on read when the window
/// has slid past one hour.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HourlyFreeUsage {
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_count: u32,
}

/// Payment row with screenshot idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub user_id: i64,
    pub amount: Decimal,
    /// Unique id of the uploaded payment screenshot
    pub screenshot_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Delivered.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Completed.is_terminal());
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"queued\"");
        assert_eq!(JobStatus::Timeout.to_string(), "timeout");
        assert_eq!("delivered".parse::<JobStatus>().unwrap(), JobStatus::Delivered);
    }

    #[test]
    fn test_update_does_not_clear_task_id() {
        let mut job = JobRecord::new(1, "model");
        JobUpdate::with_task_id("t-1").apply(&mut job, JobStatus::Queued);
        assert_eq!(job.provider_task_id.as_deref(), Some("t-1"));

        JobUpdate::with_task_id("t-2").apply(&mut job, JobStatus::Running);
        assert_eq!(job.provider_task_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let mut job = JobRecord::new(1, "model");
        JobUpdate::default().apply(&mut job, JobStatus::Failed);
        assert_eq!(job.status, JobStatus::Failed);

        let applied = JobUpdate::default().apply(&mut job, JobStatus::Running);
        assert!(!applied);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_timeout_is_reentrant() {
        let mut job = JobRecord::new(1, "model");
        JobUpdate::default().apply(&mut job, JobStatus::Timeout);
        let applied = JobUpdate::with_result_urls(vec!["https://cdn/x.png".into()])
            .apply(&mut job, JobStatus::Succeeded);
        assert!(applied);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result_urls.len(), 1);
    }

    #[test]
    fn test_same_terminal_status_is_idempotent() {
        let mut job = JobRecord::new(1, "model");
        JobUpdate::default().apply(&mut job, JobStatus::Failed);
        let applied = JobUpdate::with_error("KIE_FAIL_STATE", "boom").apply(&mut job, JobStatus::Failed);
        assert!(applied);
        assert_eq!(job.error_code.as_deref(), Some("KIE_FAIL_STATE"));
    }
}
