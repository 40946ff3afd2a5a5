use std::time::Duration;

use crate::{env_optional, env_parse, ConfigError, FromEnv};

/// Redis configuration for locks and the dedupe store.
///
/// `REDIS_URL` is optional: when unset the lock manager and dedupe store
/// degrade to their in-process implementations.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: Option<String>,
    /// Connect deadline; kept sub-second by default so degradation is fast
    pub connect_timeout: Duration,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            connect_timeout: Duration::from_millis(800),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let connect_timeout_seconds: f64 = env_parse("REDIS_CONNECT_TIMEOUT_SECONDS", 0.8)?;
        Ok(Self {
            url: env_optional("REDIS_URL"),
            connect_timeout: Duration::from_secs_f64(connect_timeout_seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_unset() {
        temp_env::with_vars(
            [
                ("REDIS_URL", None::<&str>),
                ("REDIS_CONNECT_TIMEOUT_SECONDS", None),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert!(!config.is_configured());
                assert_eq!(config.connect_timeout, Duration::from_millis(800));
            },
        );
    }

    #[test]
    fn test_redis_config_set() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://localhost:6379")),
                ("REDIS_CONNECT_TIMEOUT_SECONDS", Some("2.5")),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.url.as_deref(), Some("redis://localhost:6379"));
                assert_eq!(config.connect_timeout, Duration::from_secs_f64(2.5));
            },
        );
    }
}
