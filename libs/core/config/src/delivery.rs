use std::time::Duration;

use crate::{env_parse, ConfigError, FromEnv};

const DEFAULT_SAFE_UPLOAD_BYTES: u64 = 45 * 1024 * 1024;
const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

/// Delivery limits for the chat transport.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Payloads above this size fall back to URL delivery
    pub safe_upload_bytes: u64,
    /// Hard transport limit; never attempt uploads above it
    pub max_file_bytes: u64,
    pub download_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            safe_upload_bytes: DEFAULT_SAFE_UPLOAD_BYTES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            download_timeout: Duration::from_secs(30),
        }
    }
}

impl FromEnv for DeliveryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let download_timeout_seconds: f64 = env_parse("KIE_MEDIA_DOWNLOAD_TIMEOUT", 30.0)?;
        Ok(Self {
            safe_upload_bytes: env_parse("TELEGRAM_SAFE_UPLOAD_BYTES", DEFAULT_SAFE_UPLOAD_BYTES)?,
            max_file_bytes: env_parse("TELEGRAM_MAX_FILE_BYTES", DEFAULT_MAX_FILE_BYTES)?,
            download_timeout: Duration::from_secs_f64(download_timeout_seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_defaults() {
        temp_env::with_vars(
            [
                ("TELEGRAM_SAFE_UPLOAD_BYTES", None::<&str>),
                ("TELEGRAM_MAX_FILE_BYTES", None),
                ("KIE_MEDIA_DOWNLOAD_TIMEOUT", None),
            ],
            || {
                let config = DeliveryConfig::from_env().unwrap();
                assert_eq!(config.safe_upload_bytes, 45 * 1024 * 1024);
                assert_eq!(config.max_file_bytes, 50 * 1024 * 1024);
                assert_eq!(config.download_timeout, Duration::from_secs(30));
            },
        );
    }

    #[test]
    fn test_delivery_overrides() {
        temp_env::with_vars(
            [
                ("TELEGRAM_SAFE_UPLOAD_BYTES", Some("47185920")),
                ("TELEGRAM_MAX_FILE_BYTES", Some("52428800")),
            ],
            || {
                let config = DeliveryConfig::from_env().unwrap();
                assert_eq!(config.safe_upload_bytes, 47_185_920);
                assert_eq!(config.max_file_bytes, 52_428_800);
            },
        );
    }
}
