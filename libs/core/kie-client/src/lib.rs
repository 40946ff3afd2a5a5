//! Typed client for the KIE generation API.
//!
//! Single integration point for the provider: retries with exponential
//! backoff and jitter, a fixed error taxonomy, a circuit breaker fronting
//! every call, and an in-memory stub for offline runs.

mod backoff;
mod client;
mod error;
mod resilience;
mod stub;
mod types;

pub use backoff::{backoff_delay, should_retry};
pub use client::KieHttpClient;
pub use error::{KieError, KieResult};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use stub::KieStub;
pub use types::{ProviderState, TaskHandle, TaskRecord};

use async_trait::async_trait;
use core_config::kie::KieConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Fresh short correlation id for one user-visible exchange.
pub fn new_correlation_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Provider operations used by the job engine and reconcilers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Create a generation task; fails when the response lacks a task id.
    async fn create_task<'a>(
        &self,
        model: &str,
        input: &Value,
        callback_url: Option<&'a str>,
        correlation_id: &str,
    ) -> KieResult<TaskHandle>;

    /// Fetch one status snapshot of a task.
    async fn get_task_status(&self, task_id: &str, correlation_id: &str) -> KieResult<TaskRecord>;

    /// Best-effort cancellation.
    async fn cancel_task(&self, task_id: &str, correlation_id: &str) -> KieResult<()>;

    /// Resolve a provider CDN link into a direct binary URL.
    async fn get_download_url(&self, source_url: &str, correlation_id: &str) -> KieResult<String>;

    /// Provider-side task lookup by our job id; used by orphan recovery.
    /// The wire API has no such endpoint today, so the default is `None`.
    async fn resolve_task_id(&self, _job_id: &str) -> KieResult<Option<String>> {
        Ok(None)
    }

    /// Base URL of the provider, when it has one (the stub does not).
    fn base_url<'a>(&'a self) -> Option<&'a str> {
        None
    }

    /// Poll until the task reaches a terminal state or `timeout` elapses.
    async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Duration,
        poll_interval: Duration,
        correlation_id: &str,
    ) -> KieResult<TaskRecord> {
        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if started.elapsed() > timeout {
                return Err(KieError::classify(408, "Task timeout", correlation_id));
            }
            attempt += 1;
            match self.get_task_status(task_id, correlation_id).await {
                Ok(record) => {
                    info!(
                        action = "KIE_POLL",
                        task_id = %task_id,
                        attempt,
                        state = ?record.state,
                        "wait_for_task poll"
                    );
                    if record.state.is_terminal() {
                        return Ok(record);
                    }
                }
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Build the provider client from configuration: the live HTTP client when
/// credentials allow, else the stub.
pub fn client_from_config(config: &KieConfig) -> KieResult<Arc<dyn ProviderClient>> {
    if config.is_live() {
        Ok(Arc::new(KieHttpClient::new(config.clone())?))
    } else {
        info!(
            stub_forced = config.stub,
            has_api_key = config.api_key.is_some(),
            "Using KIE stub client"
        );
        Ok(Arc::new(KieStub::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_shape() {
        let id = new_correlation_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_correlation_id());
    }

    #[test]
    fn test_client_from_config_selects_stub_without_key() {
        let config = KieConfig::default();
        assert!(!config.is_live());
        let client = client_from_config(&config).unwrap();
        assert!(client.base_url().is_none());
    }

    #[test]
    fn test_client_from_config_selects_live_with_key() {
        let config = KieConfig {
            api_key: Some("key".to_string()),
            ..KieConfig::default()
        };
        let client = client_from_config(&config).unwrap();
        assert_eq!(client.base_url(), Some("https://api.kie.ai"));
    }
}
