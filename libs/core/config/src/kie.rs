use std::time::Duration;

use crate::{env_flag, env_optional, env_or_default, env_parse, ConfigError, FromEnv};

/// Provider (KIE) client configuration
#[derive(Clone, Debug)]
pub struct KieConfig {
    /// API key; when absent the stub client is used
    pub api_key: Option<String>,
    pub api_url: String,
    pub timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: f64,
    pub retry_max_delay: f64,
    pub circuit_breaker_enabled: bool,
    pub cb_failure_threshold: u32,
    pub cb_success_threshold: u32,
    pub cb_timeout: Duration,
    pub poll_max_attempts: u32,
    pub result_cdn_base_url: Option<String>,
    /// Force the in-memory stub regardless of credentials
    pub stub: bool,
}

impl Default for KieConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://api.kie.ai".to_string(),
            timeout: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_base_delay: 1.0,
            retry_max_delay: 60.0,
            circuit_breaker_enabled: true,
            cb_failure_threshold: 5,
            cb_success_threshold: 2,
            cb_timeout: Duration::from_secs(60),
            poll_max_attempts: 80,
            result_cdn_base_url: None,
            stub: false,
        }
    }
}

impl KieConfig {
    /// Whether live provider calls are possible with this configuration
    pub fn is_live(&self) -> bool {
        !self.stub && self.api_key.is_some()
    }
}

impl FromEnv for KieConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let timeout_seconds: f64 = env_parse("KIE_TIMEOUT_SECONDS", 30.0)?;
        let cb_timeout_seconds: f64 = env_parse("KIE_CB_TIMEOUT", 60.0)?;

        Ok(Self {
            api_key: env_optional("KIE_API_KEY"),
            api_url: env_or_default("KIE_API_URL", "https://api.kie.ai")
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs_f64(timeout_seconds),
            retry_max_attempts: env_parse("KIE_RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay: env_parse("KIE_RETRY_BASE_DELAY", 1.0)?,
            retry_max_delay: env_parse("KIE_RETRY_MAX_DELAY", 60.0)?,
            circuit_breaker_enabled: env_flag("KIE_CIRCUIT_BREAKER_ENABLED", true),
            cb_failure_threshold: env_parse("KIE_CB_FAILURE_THRESHOLD", 5)?,
            cb_success_threshold: env_parse("KIE_CB_SUCCESS_THRESHOLD", 2)?,
            cb_timeout: Duration::from_secs_f64(cb_timeout_seconds),
            poll_max_attempts: env_parse("KIE_POLL_MAX_ATTEMPTS", 80)?,
            result_cdn_base_url: env_optional("KIE_RESULT_CDN_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            stub: env_flag("KIE_STUB", false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kie_config_defaults() {
        temp_env::with_vars(
            [
                ("KIE_API_KEY", None::<&str>),
                ("KIE_API_URL", None),
                ("KIE_TIMEOUT_SECONDS", None),
                ("KIE_RETRY_MAX_ATTEMPTS", None),
                ("KIE_CIRCUIT_BREAKER_ENABLED", None),
                ("KIE_STUB", None),
            ],
            || {
                let config = KieConfig::from_env().unwrap();
                assert_eq!(config.api_url, "https://api.kie.ai");
                assert_eq!(config.timeout, Duration::from_secs(30));
                assert_eq!(config.retry_max_attempts, 3);
                assert_eq!(config.poll_max_attempts, 80);
                assert!(config.circuit_breaker_enabled);
                assert!(!config.stub);
                assert!(!config.is_live());
            },
        );
    }

    #[test]
    fn test_kie_config_strips_trailing_slash() {
        temp_env::with_var("KIE_API_URL", Some("https://kie.example.com/"), || {
            let config = KieConfig::from_env().unwrap();
            assert_eq!(config.api_url, "https://kie.example.com");
        });
    }

    #[test]
    fn test_kie_config_live_requires_key_and_no_stub() {
        temp_env::with_vars(
            [("KIE_API_KEY", Some("secret")), ("KIE_STUB", None)],
            || {
                let config = KieConfig::from_env().unwrap();
                assert!(config.is_live());
            },
        );

        temp_env::with_vars(
            [("KIE_API_KEY", Some("secret")), ("KIE_STUB", Some("1"))],
            || {
                let config = KieConfig::from_env().unwrap();
                assert!(!config.is_live());
            },
        );
    }

    #[test]
    fn test_kie_config_parse_error() {
        temp_env::with_var("KIE_RETRY_MAX_ATTEMPTS", Some("many"), || {
            assert!(KieConfig::from_env().is_err());
        });
    }
}
