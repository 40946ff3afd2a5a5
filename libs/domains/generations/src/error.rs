use kie_client::KieError;
use std::time::Duration;
use thiserror::Error;

use crate::dedupe::DedupeError;

/// Failure modes of a generation run.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Model '{0}' not found in catalog")]
    ModelNotFound(String),

    #[error("Invalid parameters ({code}): {message}")]
    Validation {
        code: &'static str,
        message: String,
    },

    #[error("Provider request failed: {0}")]
    ProviderRequest(#[from] KieError),

    #[error("Provider job failed ({})", .fail_code.as_deref().unwrap_or("KIE_FAIL_STATE"))]
    ProviderJobFailed {
        fail_code: Option<String>,
        fail_msg: Option<String>,
        correlation_id: String,
    },

    #[error("Result parsing failed ({code}): {fix_hint}")]
    ResultParse {
        code: &'static str,
        fix_hint: String,
    },

    #[error("Generation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Generation was canceled")]
    Canceled,

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error(transparent)]
    Lock(#[from] distributed_lock::LockError),

    #[error(transparent)]
    Dedupe(#[from] DedupeError),
}

impl GenerationError {
    pub fn param_missing(fields: &[String]) -> Self {
        Self::Validation {
            code: "PARAM_MISSING",
            message: format!("Missing required fields: {}", fields.join(", ")),
        }
    }

    pub fn param_invalid_enum(field: &str, value: &str) -> Self {
        Self::Validation {
            code: "PARAM_INVALID_ENUM",
            message: format!("Field '{field}' has unsupported value '{value}'"),
        }
    }

    /// Stable code carried into logs, job rows, and user-facing messages.
    pub fn error_code(&self) -> &str {
        match self {
            Self::ModelNotFound(_) => "MODEL_NOT_FOUND",
            Self::Validation { code, .. } => code,
            Self::ProviderRequest(e) => match e {
                KieError::Unauthorized { .. } | KieError::PaymentRequired { .. } => "KIE_AUTH",
                KieError::RateLimited { .. } => "KIE_RATE_LIMIT",
                KieError::CircuitOpen { .. } => "CIRCUIT_BREAKER_OPEN",
                KieError::Validation { .. } => "KIE_FAIL_STATE",
                _ => "KIE_TIMEOUT",
            },
            Self::ProviderJobFailed { fail_code, .. } => {
                fail_code.as_deref().unwrap_or("KIE_FAIL_STATE")
            }
            Self::ResultParse { code, .. } => code,
            Self::Timeout { .. } => "KIE_TIMEOUT",
            Self::Canceled => "KIE_CANCELED",
            Self::Storage(e) => e.code(),
            Self::Lock(_) => "INTERNAL_EXCEPTION",
            Self::Dedupe(_) => "INTERNAL_EXCEPTION",
        }
    }

    /// Whether no charge must ever be committed for a run ending this way.
    pub fn forbids_charge(&self) -> bool {
        // Every error path forbids charging; billing happens only after a
        // delivered result.
        true
    }
}

pub type GenerationResult<T> = Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_codes() {
        let missing = GenerationError::param_missing(&["prompt".to_string()]);
        assert_eq!(missing.error_code(), "PARAM_MISSING");
        assert!(missing.to_string().contains("prompt"));

        let invalid = GenerationError::param_invalid_enum("style", "neon");
        assert_eq!(invalid.error_code(), "PARAM_INVALID_ENUM");
    }

    #[test]
    fn test_provider_error_codes() {
        let auth: GenerationError = KieError::classify(401, "no", "c").into();
        assert_eq!(auth.error_code(), "KIE_AUTH");

        let limited: GenerationError = KieError::classify(429, "slow", "c").into();
        assert_eq!(limited.error_code(), "KIE_RATE_LIMIT");

        let open: GenerationError = KieError::CircuitOpen {
            retry_after: Duration::from_secs(5),
            correlation_id: "c".into(),
        }
        .into();
        assert_eq!(open.error_code(), "CIRCUIT_BREAKER_OPEN");
    }

    #[test]
    fn test_job_failed_prefers_provider_code() {
        let err = GenerationError::ProviderJobFailed {
            fail_code: Some("NSFW_BLOCK".into()),
            fail_msg: Some("blocked".into()),
            correlation_id: "c".into(),
        };
        assert_eq!(err.error_code(), "NSFW_BLOCK");

        let bare = GenerationError::ProviderJobFailed {
            fail_code: None,
            fail_msg: None,
            correlation_id: "c".into(),
        };
        assert_eq!(bare.error_code(), "KIE_FAIL_STATE");
    }

    #[test]
    fn test_all_errors_forbid_charge() {
        assert!(GenerationError::Canceled.forbids_charge());
        assert!(GenerationError::Timeout {
            elapsed: Duration::from_secs(900)
        }
        .forbids_charge());
    }
}
