//! Live HTTP implementation of [`ProviderClient`].

use async_trait::async_trait;
use core_config::kie::KieConfig;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{info, warn};

use crate::backoff::{backoff_delay, should_retry};
use crate::error::{KieError, KieResult};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use crate::types::{TaskHandle, TaskRecord};
use crate::ProviderClient;

const CREATE_TASK_PATH: &str = "/api/v1/jobs/createTask";
const RECORD_INFO_PATH: &str = "/api/v1/jobs/recordInfo";
const CANCEL_TASK_PATH: &str = "/api/v1/jobs/cancelTask";
const DOWNLOAD_URL_PATH: &str = "/api/v1/common/download-url";

pub struct KieHttpClient {
    config: KieConfig,
    http: reqwest::Client,
    breaker: Option<CircuitBreaker>,
}

impl KieHttpClient {
    pub fn new(config: KieConfig) -> KieResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| KieError::Network {
                message: format!("failed to build HTTP client: {e}"),
                correlation_id: "startup".to_string(),
            })?;
        let breaker = config.circuit_breaker_enabled.then(|| {
            info!(
                failure_threshold = config.cb_failure_threshold,
                success_threshold = config.cb_success_threshold,
                timeout_s = config.cb_timeout.as_secs(),
                "KIE circuit breaker enabled"
            );
            CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: config.cb_failure_threshold,
                success_threshold: config.cb_success_threshold,
                timeout: config.cb_timeout,
            })
        });
        Ok(Self {
            config,
            http,
            breaker,
        })
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    fn parse_json(text: &str) -> Value {
        if text.is_empty() {
            return json!({});
        }
        serde_json::from_str(text).unwrap_or_else(|_| json!({}))
    }

    /// One provider exchange with breaker gating and retry/backoff.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
        params: Option<&[(&str, &str)]>,
        correlation_id: &str,
    ) -> KieResult<Value> {
        if let Some(breaker) = &self.breaker {
            if let Err(retry_after) = breaker.check() {
                warn!(
                    method = %method,
                    path = %path,
                    retry_after_s = retry_after.as_secs(),
                    "Circuit breaker rejected provider request"
                );
                return Err(KieError::CircuitOpen {
                    retry_after,
                    correlation_id: correlation_id.to_string(),
                });
            }
        }

        let result = self
            .request_json_impl(method, path, payload, params, correlation_id)
            .await;

        if let Some(breaker) = &self.breaker {
            match &result {
                Err(KieError::Network { .. }) | Err(KieError::Server { .. }) => {
                    breaker.record_failure()
                }
                _ => breaker.record_success(),
            }
        }
        result
    }

    async fn request_json_impl(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
        params: Option<&[(&str, &str)]>,
        correlation_id: &str,
    ) -> KieResult<Value> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(KieError::Unauthorized {
                message: "KIE_API_KEY not configured".to_string(),
                correlation_id: correlation_id.to_string(),
            });
        };

        let url = format!("{}{}", self.config.api_url, path);
        let max_retries = self.config.retry_max_attempts;

        for attempt in 1..=max_retries + 1 {
            let started = Instant::now();
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Accept", "application/json")
                .header("Authorization", format!("Bearer {api_key}"))
                .header("X-Request-ID", correlation_id);
            if let Some(payload) = payload {
                request = request.json(payload);
            }
            if let Some(params) = params {
                request = request.query(params);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    let latency_ms = started.elapsed().as_millis() as u64;
                    info!(
                        action = "KIE_HTTP",
                        method = %method,
                        path = %path,
                        status,
                        attempt,
                        latency_ms,
                        "provider request"
                    );
                    observability::record_provider_request(
                        path,
                        if (200..300).contains(&status) { "ok" } else { "error" },
                    );

                    if status == 200 || status == 201 {
                        return Ok(Self::parse_json(&text));
                    }
                    if attempt <= max_retries && should_retry(status) {
                        tokio::time::sleep(backoff_delay(
                            attempt,
                            Some(status),
                            self.config.retry_base_delay,
                            self.config.retry_max_delay,
                        ))
                        .await;
                        continue;
                    }
                    let body = Self::parse_json(&text);
                    let message = body
                        .get("msg")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            if text.is_empty() {
                                format!("HTTP {status}")
                            } else {
                                text.clone()
                            }
                        });
                    return Err(KieError::classify(status, message, correlation_id));
                }
                Err(e) => {
                    observability::record_provider_request(path, "network_error");
                    if attempt <= max_retries {
                        tokio::time::sleep(backoff_delay(
                            attempt,
                            None,
                            self.config.retry_base_delay,
                            self.config.retry_max_delay,
                        ))
                        .await;
                        continue;
                    }
                    return Err(KieError::classify(0, e.to_string(), correlation_id));
                }
            }
        }

        Err(KieError::classify(0, "retries exhausted", correlation_id))
    }

    /// Reject envelopes whose embedded `code` is not 200.
    fn check_envelope<'a>(
        body: &'a Value,
        correlation_id: &str,
    ) -> KieResult<&'a Value> {
        let code = body.get("code").and_then(Value::as_i64);
        if code != Some(200) {
            let message = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(KieError::Validation {
                message: message.to_string(),
                correlation_id: correlation_id.to_string(),
            });
        }
        Ok(body.get("data").unwrap_or(&Value::Null))
    }
}

#[async_trait]
impl ProviderClient for KieHttpClient {
    async fn create_task(
        &self,
        model: &str,
        input: &Value,
        callback_url: Option<&str>,
        correlation_id: &str,
    ) -> KieResult<TaskHandle> {
        let mut payload = json!({ "model": model, "input": input });
        if let Some(callback_url) = callback_url {
            payload["callBackUrl"] = json!(callback_url);
        }

        let input_keys: Vec<&str> = input
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();
        info!(
            action = "KIE_CREATE",
            model = %model,
            input_keys = ?input_keys,
            has_callback = callback_url.is_some(),
            correlation_id = %correlation_id,
            "creating provider task"
        );

        let started = Instant::now();
        let body = self
            .request_json(
                Method::POST,
                CREATE_TASK_PATH,
                Some(&payload),
                None,
                correlation_id,
            )
            .await?;
        let data = Self::check_envelope(&body, correlation_id)?;
        let Some(task_id) = data.get("taskId").and_then(Value::as_str) else {
            warn!(
                action = "KIE_CREATE",
                model = %model,
                correlation_id = %correlation_id,
                "provider returned 200 without taskId"
            );
            return Err(KieError::Validation {
                message: "No taskId in response".to_string(),
                correlation_id: correlation_id.to_string(),
            });
        };
        info!(
            action = "KIE_CREATE",
            model = %model,
            task_id = %task_id,
            duration_ms = started.elapsed().as_millis() as u64,
            correlation_id = %correlation_id,
            "provider task created"
        );
        Ok(TaskHandle {
            task_id: task_id.to_string(),
            correlation_id: correlation_id.to_string(),
        })
    }

    async fn get_task_status(&self, task_id: &str, correlation_id: &str) -> KieResult<TaskRecord> {
        let started = Instant::now();
        let body = self
            .request_json(
                Method::GET,
                RECORD_INFO_PATH,
                None,
                Some(&[("taskId", task_id)]),
                correlation_id,
            )
            .await?;
        let data = Self::check_envelope(&body, correlation_id)?;
        let record = TaskRecord::from_payload(task_id, data, correlation_id);
        info!(
            action = "KIE_POLL",
            task_id = %task_id,
            state = ?record.state,
            state_raw = record.state_raw.as_deref().unwrap_or("-"),
            fail_code = record.fail_code.as_deref().unwrap_or("-"),
            duration_ms = started.elapsed().as_millis() as u64,
            correlation_id = %correlation_id,
            "provider task polled"
        );
        Ok(record)
    }

    async fn cancel_task(&self, task_id: &str, correlation_id: &str) -> KieResult<()> {
        let payload = json!({ "taskId": task_id });
        let body = self
            .request_json(
                Method::POST,
                CANCEL_TASK_PATH,
                Some(&payload),
                None,
                correlation_id,
            )
            .await?;
        // Cancel replies may omit the code field entirely.
        let code = body.get("code").and_then(Value::as_i64);
        if !matches!(code, None | Some(200)) {
            let message = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(KieError::Validation {
                message: message.to_string(),
                correlation_id: correlation_id.to_string(),
            });
        }
        info!(
            action = "KIE_CANCEL",
            task_id = %task_id,
            correlation_id = %correlation_id,
            "provider task cancel requested"
        );
        Ok(())
    }

    async fn get_download_url(&self, source_url: &str, correlation_id: &str) -> KieResult<String> {
        let payload = json!({ "url": source_url });
        let body = self
            .request_json(
                Method::POST,
                DOWNLOAD_URL_PATH,
                Some(&payload),
                None,
                correlation_id,
            )
            .await?;
        let url = body
            .pointer("/data/url")
            .or_else(|| body.get("url"))
            .and_then(Value::as_str);
        match url {
            Some(url) => Ok(url.to_string()),
            None => Err(KieError::Validation {
                message: "missing_download_url".to_string(),
                correlation_id: correlation_id.to_string(),
            }),
        }
    }

    fn base_url(&self) -> Option<&str> {
        Some(&self.config.api_url)
    }
}
