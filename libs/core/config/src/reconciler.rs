use std::time::Duration;

use crate::{env_parse, ConfigError, FromEnv};

/// Background reconciler cadence and alert thresholds.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub batch_limit: usize,
    pub pending_age_alert: Duration,
    pub queue_tail_alert_threshold: usize,
    pub orphan_max_age: Duration,
    pub orphan_alert_threshold: usize,
    pub notify_cooldown: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_limit: 50,
            pending_age_alert: Duration::from_secs(1800),
            queue_tail_alert_threshold: 25,
            orphan_max_age: Duration::from_secs(600),
            orphan_alert_threshold: 10,
            notify_cooldown: Duration::from_secs(900),
        }
    }
}

impl FromEnv for ReconcilerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            interval: Duration::from_secs(env_parse("RECONCILER_INTERVAL_SECONDS", 60u64)?),
            batch_limit: env_parse("RECONCILER_BATCH_LIMIT", 50usize)?,
            pending_age_alert: Duration::from_secs(env_parse(
                "PENDING_AGE_ALERT_SECONDS",
                1800u64,
            )?),
            queue_tail_alert_threshold: env_parse("QUEUE_TAIL_ALERT_THRESHOLD", 25usize)?,
            orphan_max_age: Duration::from_secs(env_parse("ORPHAN_MAX_AGE_SECONDS", 600u64)?),
            orphan_alert_threshold: env_parse("ORPHAN_ALERT_THRESHOLD", 10usize)?,
            notify_cooldown: Duration::from_secs(env_parse(
                "ORPHAN_NOTIFY_COOLDOWN_SECONDS",
                900u64,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_defaults() {
        temp_env::with_vars(
            [
                ("RECONCILER_INTERVAL_SECONDS", None::<&str>),
                ("RECONCILER_BATCH_LIMIT", None),
                ("ORPHAN_MAX_AGE_SECONDS", None),
            ],
            || {
                let config = ReconcilerConfig::from_env().unwrap();
                assert_eq!(config.interval, Duration::from_secs(60));
                assert_eq!(config.batch_limit, 50);
                assert_eq!(config.orphan_max_age, Duration::from_secs(600));
                assert_eq!(config.notify_cooldown, Duration::from_secs(900));
            },
        );
    }

    #[test]
    fn test_reconciler_overrides() {
        temp_env::with_vars(
            [
                ("RECONCILER_INTERVAL_SECONDS", Some("15")),
                ("QUEUE_TAIL_ALERT_THRESHOLD", Some("100")),
            ],
            || {
                let config = ReconcilerConfig::from_env().unwrap();
                assert_eq!(config.interval, Duration::from_secs(15));
                assert_eq!(config.queue_tail_alert_threshold, 100);
            },
        );
    }
}
