//! Provider error taxonomy.
//!
//! HTTP statuses map onto a fixed set of codes so the rest of the system
//! (and the user-facing transport) never deals with raw statuses.

use std::time::Duration;
use thiserror::Error;

/// Typed provider error carrying the correlation id of the failed exchange.
#[derive(Error, Debug, Clone)]
pub enum KieError {
    #[error("KIE API key rejected: {message}")]
    Unauthorized {
        message: String,
        correlation_id: String,
    },

    #[error("KIE account has insufficient credits: {message}")]
    PaymentRequired {
        message: String,
        correlation_id: String,
    },

    #[error("KIE rejected the request parameters: {message}")]
    Validation {
        message: String,
        correlation_id: String,
    },

    #[error("KIE rate limit hit: {message}")]
    RateLimited {
        message: String,
        correlation_id: String,
    },

    #[error("KIE server error (HTTP {status}): {message}")]
    Server {
        status: u16,
        message: String,
        correlation_id: String,
    },

    #[error("Network error talking to KIE: {message}")]
    Network {
        message: String,
        correlation_id: String,
    },

    #[error("KIE circuit breaker is open; next probe in {retry_after:?}")]
    CircuitOpen {
        retry_after: Duration,
        correlation_id: String,
    },

    #[error("Unexpected KIE error (HTTP {status}): {message}")]
    Unknown {
        status: u16,
        message: String,
        correlation_id: String,
    },
}

impl KieError {
    /// Map an HTTP status into the taxonomy. Status 0 means no response.
    pub fn classify(status: u16, message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        let message = message.into();
        let correlation_id = correlation_id.into();
        match status {
            401 => Self::Unauthorized {
                message,
                correlation_id,
            },
            402 => Self::PaymentRequired {
                message,
                correlation_id,
            },
            422 => Self::Validation {
                message,
                correlation_id,
            },
            429 => Self::RateLimited {
                message,
                correlation_id,
            },
            500..=599 => Self::Server {
                status,
                message,
                correlation_id,
            },
            0 => Self::Network {
                message,
                correlation_id,
            },
            _ => Self::Unknown {
                status,
                message,
                correlation_id,
            },
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::PaymentRequired { .. } => "payment_required",
            Self::Validation { .. } => "validation_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Network { .. } => "network_error",
            Self::CircuitOpen { .. } => "circuit_breaker_open",
            Self::Unknown { .. } => "unknown_error",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Unauthorized { correlation_id, .. }
            | Self::PaymentRequired { correlation_id, .. }
            | Self::Validation { correlation_id, .. }
            | Self::RateLimited { correlation_id, .. }
            | Self::Server { correlation_id, .. }
            | Self::Network { correlation_id, .. }
            | Self::CircuitOpen { correlation_id, .. }
            | Self::Unknown { correlation_id, .. } => correlation_id,
        }
    }

    /// Whether a fresh attempt could succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network { .. }
        )
    }

    /// Short user-facing message; translated at the transport layer.
    pub fn user_message(&self) -> String {
        let correlation_id = self.correlation_id();
        match self {
            Self::Unauthorized { .. } => {
                format!("Invalid KIE API key.\nID: {correlation_id}")
            }
            Self::PaymentRequired { .. } => {
                format!("Insufficient funds on the KIE account.\nID: {correlation_id}")
            }
            Self::Validation { message, .. } => {
                format!("Model parameter error.\nHint: {message}\nID: {correlation_id}")
            }
            Self::RateLimited { .. } => {
                format!("Too many requests. Please try again shortly.\nID: {correlation_id}")
            }
            Self::Server { .. } => {
                format!("KIE API is temporarily unavailable. Try again later.\nID: {correlation_id}")
            }
            Self::Network { .. } => {
                format!("Could not reach the KIE API. Try again.\nID: {correlation_id}")
            }
            Self::CircuitOpen { retry_after, .. } => format!(
                "KIE API is temporarily unavailable after repeated failures.\nTry again in {}s.\nID: {correlation_id}",
                retry_after.as_secs().max(1)
            ),
            Self::Unknown { .. } => {
                format!("Error calling the KIE API. Try again.\nID: {correlation_id}")
            }
        }
    }
}

pub type KieResult<T> = Result<T, KieError>;
