//! The submit-poll-resolve orchestration for one generation job.

use async_trait::async_trait;
use domain_catalog::ModelCatalog;
use kie_client::{KieError, ProviderClient, ProviderState, TaskRecord};
use rand::RngExt;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use storage::{JobRecord, JobStatus, JobUpdate, StorageHandle};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dedupe::{DedupeKey, DedupeStatus, DedupeStore};
use crate::error::{GenerationError, GenerationResult};
use crate::fingerprint::prompt_fingerprint;
use crate::payload::build_provider_payload;
use crate::result::{parse_record_info, JobResult};
use crate::urls::UrlContext;
use crate::validate::ResultValidator;

/// Engine-wide polling and timeout policy.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Overall wall-clock bound per job
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Poll attempt bound; first of this and `timeout` wins
    pub poll_max_attempts: u32,
    pub poll_max_delay: Duration,
    /// How long a job may sit in the waiting state before the watchdog fires
    pub waiting_timeout: Option<Duration>,
    pub result_cdn_base_url: Option<String>,
    pub provider_base_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            poll_interval: Duration::from_secs(3),
            poll_max_attempts: 80,
            poll_max_delay: Duration::from_secs(12),
            waiting_timeout: None,
            result_cdn_base_url: None,
            provider_base_url: None,
        }
    }
}

/// Progress notification pushed to the transport layer.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub stage: &'static str,
    pub task_id: Option<String>,
    pub state: Option<String>,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, update: ProgressUpdate);
}

/// Invoked when a job has sat in the waiting state past the configured
/// threshold; may return a replacement task id to poll instead.
#[async_trait]
pub trait WaitingTimeoutHandler: Send + Sync {
    async fn on_waiting_timeout(&self, task_id: &str) -> Option<String>;
}

/// One generation to execute.
pub struct GenerationRequest {
    pub user_id: i64,
    pub model_id: String,
    pub params: Value,
    pub request_id: String,
    pub prompt_fingerprint: String,
    pub prompt: Option<String>,
    pub job_id: String,
    pub correlation_id: String,
    pub price: Decimal,
    pub sku_id: Option<String>,
    pub free: bool,
    pub cancel: Option<watch::Receiver<bool>>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub on_waiting_timeout: Option<Arc<dyn WaitingTimeoutHandler>>,
}

impl GenerationRequest {
    pub fn new(user_id: i64, model_id: impl Into<String>, params: Value) -> Self {
        let model_id = model_id.into();
        let fingerprint = prompt_fingerprint(&model_id, &params);
        let prompt = params
            .get("prompt")
            .or_else(|| params.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            user_id,
            model_id,
            params,
            request_id: Uuid::new_v4().to_string(),
            prompt_fingerprint: fingerprint,
            prompt,
            job_id: Uuid::now_v7().to_string(),
            correlation_id: kie_client::new_correlation_id(),
            price: Decimal::ZERO,
            sku_id: None,
            free: false,
            cancel: None,
            progress: None,
            on_waiting_timeout: None,
        }
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::new(
            self.user_id,
            self.model_id.clone(),
            self.prompt_fingerprint.clone(),
        )
    }

    pub fn with_pricing(mut self, sku_id: impl Into<String>, price: Decimal, free: bool) -> Self {
        self.sku_id = Some(sku_id.into());
        self.price = price;
        self.free = free;
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Per-job orchestrator: validate, submit, poll, resolve.
pub struct JobEngine {
    client: Arc<dyn ProviderClient>,
    storage: StorageHandle,
    catalog: Arc<ModelCatalog>,
    dedupe: Arc<dyn DedupeStore>,
    validator: Arc<dyn ResultValidator>,
    config: EngineConfig,
}

impl JobEngine {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        storage: StorageHandle,
        catalog: Arc<ModelCatalog>,
        dedupe: Arc<dyn DedupeStore>,
        validator: Arc<dyn ResultValidator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            storage,
            catalog,
            dedupe,
            validator,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn notify(&self, request: &GenerationRequest, update: ProgressUpdate) {
        if let Some(progress) = &request.progress {
            progress.on_progress(update).await;
        }
    }

    async fn mark_dedupe(
        &self,
        key: &DedupeKey,
        status: DedupeStatus,
    ) {
        let result = self
            .dedupe
            .update(key, Box::new(move |entry| entry.status = status))
            .await;
        if let Err(e) = result {
            warn!(error = %e, "dedupe status update failed");
        }
    }

    /// Execute one generation to a typed [`JobResult`].
    pub async fn run_generation(
        &self,
        mut request: GenerationRequest,
    ) -> GenerationResult<JobResult> {
        let spec = self
            .catalog
            .get(&request.model_id)
            .ok_or_else(|| GenerationError::ModelNotFound(request.model_id.clone()))?
            .clone();

        // Phase 1: validate & build the provider payload.
        let payload = build_provider_payload(&self.catalog, &spec, &request.params)?;
        let dedupe_key = request.dedupe_key();

        info!(
            action = "KIE_SUBMIT",
            correlation_id = %request.correlation_id,
            user_id = request.user_id,
            model_id = %request.model_id,
            job_id = %request.job_id,
            "generation submit started"
        );

        // Phase 2: submit.
        {
            let job_id = request.job_id.clone();
            let request_id = request.request_id.clone();
            self.dedupe
                .update(
                    &dedupe_key,
                    Box::new(move |entry| {
                        entry.status = DedupeStatus::CreateStart;
                        entry.job_id = Some(job_id);
                        entry.request_id = Some(request_id);
                    }),
                )
                .await?;
        }

        let create_started = Instant::now();
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(spec.provider_model())
            .to_string();
        let input = payload.get("input").cloned().unwrap_or(Value::Null);
        let handle = match self
            .client
            .create_task(&model, &input, None, &request.correlation_id)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                observability::record_phase_duration("KIE_CREATE", create_started.elapsed());
                observability::record_job_outcome(&request.model_id, "create_failed");
                self.mark_dedupe(&dedupe_key, DedupeStatus::Failed).await;
                warn!(
                    action = "KIE_CREATE",
                    correlation_id = %request.correlation_id,
                    error_code = e.code(),
                    duration_ms = create_started.elapsed().as_millis() as u64,
                    "provider task creation failed"
                );
                return Err(e.into());
            }
        };
        observability::record_phase_duration("KIE_CREATE", create_started.elapsed());
        let task_id = handle.task_id;
        info!(
            action = "KIE_CREATE",
            correlation_id = %request.correlation_id,
            task_id = %task_id,
            duration_ms = create_started.elapsed().as_millis() as u64,
            "provider task created"
        );

        let mut job = JobRecord::new(request.user_id, request.model_id.clone());
        job.job_id = request.job_id.clone();
        job.request_id = Some(request.request_id.clone());
        job.prompt_fingerprint = Some(request.prompt_fingerprint.clone());
        job.params = request.params.clone();
        job.provider_task_id = Some(task_id.clone());
        job.status = JobStatus::Queued;
        job.price = request.price;
        job.sku_id = request.sku_id.clone();
        job.free = request.free;
        job.prompt = request.prompt.clone();
        self.storage.add_generation_job(job).await?;

        {
            let task = task_id.clone();
            self.dedupe
                .update(
                    &dedupe_key,
                    Box::new(move |entry| {
                        entry.status = DedupeStatus::TaskCreated;
                        entry.task_id = Some(task);
                    }),
                )
                .await?;
        }
        self.dedupe
            .set_job_task(&request.job_id, Some(&task_id))
            .await?;
        self.notify(
            &request,
            ProgressUpdate {
                stage: "KIE_CREATE",
                task_id: Some(task_id.clone()),
                state: None,
            },
        )
        .await;

        // Phase 3: poll.
        let mut cancel = request.cancel.take();
        let record = self
            .wait_job_result(&request, &dedupe_key, task_id, &mut cancel)
            .await?;

        // Phase 4: resolve.
        self.notify(
            &request,
            ProgressUpdate {
                stage: "KIE_COMPLETE",
                task_id: Some(record.task_id.clone()),
                state: record.state_raw.clone(),
            },
        )
        .await;
        let parse_started = Instant::now();
        let raw = record.to_raw();
        let ctx = UrlContext {
            base_url: self.config.result_cdn_base_url.as_deref(),
            provider_base_url: self
                .config
                .provider_base_url
                .as_deref()
                .or_else(|| self.client.base_url()),
            record: Some(&raw),
            correlation_id: Some(&request.correlation_id),
            model_id: Some(&request.model_id),
        };
        let resolved = parse_record_info(&raw, spec.output_media_type, &request.model_id, &ctx);
        let result = match resolved {
            Ok(result) => result,
            Err(e) => {
                self.fail_job(&request, &dedupe_key, &e).await;
                observability::record_phase_duration("KIE_PARSE", parse_started.elapsed());
                return Err(e);
            }
        };
        if !result.urls.is_empty() {
            if let Err(e) = self
                .validator
                .validate(&result.urls, Some(result.media_type), &request.correlation_id)
                .await
            {
                self.fail_job(&request, &dedupe_key, &e).await;
                observability::record_phase_duration("KIE_PARSE", parse_started.elapsed());
                return Err(e);
            }
        }
        observability::record_phase_duration("KIE_PARSE", parse_started.elapsed());

        // Phase 5: persist & return.
        self.storage
            .update_job_status(
                &request.job_id,
                JobStatus::Completed,
                JobUpdate {
                    result_urls: Some(result.urls.clone()),
                    result_text: result.text.clone(),
                    ..JobUpdate::default()
                },
            )
            .await?;
        {
            let urls = result.urls.clone();
            let text = result.text.clone();
            let media = result.media_type;
            self.dedupe
                .update(
                    &dedupe_key,
                    Box::new(move |entry| {
                        entry.status = DedupeStatus::Completed;
                        entry.media_type = Some(media);
                        entry.result_urls = urls;
                        entry.result_text = text;
                    }),
                )
                .await?;
        }
        observability::record_job_outcome(&request.model_id, "completed");
        info!(
            action = "KIE_DONE",
            correlation_id = %request.correlation_id,
            task_id = %result.task_id,
            media_type = %result.media_type,
            "generation completed"
        );
        Ok(result)
    }

    async fn fail_job(
        &self,
        request: &GenerationRequest,
        dedupe_key: &DedupeKey,
        error: &GenerationError,
    ) {
        let update = JobUpdate::with_error(error.error_code().to_string(), error.to_string());
        if let Err(e) = self
            .storage
            .update_job_status(&request.job_id, JobStatus::Failed, update)
            .await
        {
            warn!(job_id = %request.job_id, error = %e, "failed to persist job failure");
        }
        self.mark_dedupe(dedupe_key, DedupeStatus::Failed).await;
        observability::record_job_outcome(&request.model_id, "failed");
    }

    /// Poll the provider until terminal, bounded by the first of wall-clock
    /// timeout and max attempts.
    async fn wait_job_result(
        &self,
        request: &GenerationRequest,
        dedupe_key: &DedupeKey,
        initial_task_id: String,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> GenerationResult<TaskRecord> {
        let mut task_id = initial_task_id;
        let base_delay = self.config.poll_interval.max(Duration::from_secs(1));
        let max_delay = self.config.poll_max_delay.max(base_delay);
        let mut delay = base_delay;
        let mut attempt: u32 = 0;
        let started = Instant::now();
        let mut waiting_since = Instant::now();
        // One watchdog shot per waiting period; re-armed on task switch or
        // when the job starts running.
        let mut watchdog_armed = true;
        let poll_started = Instant::now();

        loop {
            if cancel_requested(cancel) {
                return self.handle_cancel(request, dedupe_key, &task_id).await;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout || attempt >= self.config.poll_max_attempts {
                observability::record_phase_duration("KIE_POLL", poll_started.elapsed());
                observability::record_job_outcome(&request.model_id, "timeout");
                let update = JobUpdate::with_error("KIE_TIMEOUT", "timeout");
                if let Err(e) = self
                    .storage
                    .update_job_status(&request.job_id, JobStatus::Timeout, update)
                    .await
                {
                    warn!(job_id = %request.job_id, error = %e, "failed to persist timeout");
                }
                warn!(
                    action = "KIE_POLL",
                    correlation_id = %request.correlation_id,
                    task_id = %task_id,
                    attempt,
                    duration_ms = elapsed.as_millis() as u64,
                    error_code = "KIE_TIMEOUT",
                    "generation timed out"
                );
                return Err(GenerationError::Timeout { elapsed });
            }

            attempt += 1;
            let record = match self
                .client
                .get_task_status(&task_id, &request.correlation_id)
                .await
            {
                Ok(record) => record,
                Err(e) if poll_retryable(&e) => {
                    if sleep_or_cancel(cancel, delay_with_jitter(delay)).await {
                        return self.handle_cancel(request, dedupe_key, &task_id).await;
                    }
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
                Err(e) => {
                    self.fail_job(request, dedupe_key, &GenerationError::ProviderRequest(e.clone()))
                        .await;
                    return Err(e.into());
                }
            };

            if attempt == 1 {
                self.notify(
                    request,
                    ProgressUpdate {
                        stage: "KIE_POLL",
                        task_id: Some(task_id.clone()),
                        state: record.state_raw.clone(),
                    },
                )
                .await;
            }

            match record.state {
                ProviderState::Queued => {
                    self.persist_poll_state(request, dedupe_key, JobStatus::Queued, DedupeStatus::Waiting)
                        .await;
                    let watchdog_due = watchdog_armed
                        && self
                            .config
                            .waiting_timeout
                            .is_some_and(|timeout| waiting_since.elapsed() >= timeout);
                    if watchdog_due {
                        watchdog_armed = false;
                        if let Some(new_task_id) = self
                            .fire_waiting_watchdog(request, dedupe_key, &task_id, waiting_since)
                            .await
                        {
                            task_id = new_task_id;
                            waiting_since = Instant::now();
                            watchdog_armed = true;
                        }
                    }
                }
                ProviderState::Running => {
                    self.persist_poll_state(request, dedupe_key, JobStatus::Running, DedupeStatus::Running)
                        .await;
                    waiting_since = Instant::now();
                    watchdog_armed = true;
                }
                ProviderState::Succeeded => {
                    observability::record_phase_duration("KIE_POLL", poll_started.elapsed());
                    let update = JobUpdate::with_result_urls(record.result_urls.clone());
                    if let Err(e) = self
                        .storage
                        .update_job_status(&request.job_id, JobStatus::Succeeded, update)
                        .await
                    {
                        warn!(job_id = %request.job_id, error = %e, "failed to persist success");
                    }
                    self.mark_dedupe(dedupe_key, DedupeStatus::Succeeded).await;
                    self.notify(
                        request,
                        ProgressUpdate {
                            stage: "KIE_DONE",
                            task_id: Some(task_id.clone()),
                            state: record.state_raw.clone(),
                        },
                    )
                    .await;
                    return Ok(record);
                }
                ProviderState::Failed => {
                    observability::record_phase_duration("KIE_POLL", poll_started.elapsed());
                    let error = GenerationError::ProviderJobFailed {
                        fail_code: record.fail_code.clone(),
                        fail_msg: record.failure_message().map(str::to_string),
                        correlation_id: request.correlation_id.clone(),
                    };
                    self.fail_job(request, dedupe_key, &error).await;
                    return Err(error);
                }
                ProviderState::Canceled => {
                    return self.handle_cancel(request, dedupe_key, &task_id).await;
                }
                ProviderState::Unknown => {}
            }

            if sleep_or_cancel(cancel, delay_with_jitter(delay)).await {
                return self.handle_cancel(request, dedupe_key, &task_id).await;
            }
            delay = (delay * 2).min(max_delay);
        }
    }

    async fn persist_poll_state(
        &self,
        request: &GenerationRequest,
        dedupe_key: &DedupeKey,
        status: JobStatus,
        dedupe_status: DedupeStatus,
    ) {
        if let Err(e) = self
            .storage
            .update_job_status(&request.job_id, status, JobUpdate::default())
            .await
        {
            warn!(job_id = %request.job_id, error = %e, "failed to persist poll state");
        }
        self.mark_dedupe(dedupe_key, dedupe_status).await;
    }

    async fn fire_waiting_watchdog(
        &self,
        request: &GenerationRequest,
        dedupe_key: &DedupeKey,
        task_id: &str,
        waiting_since: Instant,
    ) -> Option<String> {
        let handler = request.on_waiting_timeout.as_ref()?;
        warn!(
            action = "KIE_WAITING_TIMEOUT",
            correlation_id = %request.correlation_id,
            task_id = %task_id,
            waited_ms = waiting_since.elapsed().as_millis() as u64,
            "waiting-timeout watchdog fired"
        );
        let replacement = handler.on_waiting_timeout(task_id).await?;
        info!(
            action = "KIE_WAITING_TIMEOUT",
            old_task_id = %task_id,
            new_task_id = %replacement,
            "switching poll to replacement task"
        );
        {
            let new_task = replacement.clone();
            let result = self
                .dedupe
                .update(
                    dedupe_key,
                    Box::new(move |entry| entry.task_id = Some(new_task)),
                )
                .await;
            if let Err(e) = result {
                warn!(error = %e, "failed to record replacement task id");
            }
        }
        if let Err(e) = self
            .dedupe
            .set_job_task(&request.job_id, Some(&replacement))
            .await
        {
            warn!(error = %e, "failed to update job/task index");
        }
        Some(replacement)
    }

    /// Compensate a canceled job: best-effort provider cancel, terminal
    /// status, dedupe cleanup. No charge is ever committed on this path.
    async fn handle_cancel(
        &self,
        request: &GenerationRequest,
        dedupe_key: &DedupeKey,
        task_id: &str,
    ) -> GenerationResult<TaskRecord> {
        if let Err(e) = self
            .client
            .cancel_task(task_id, &request.correlation_id)
            .await
        {
            warn!(task_id = %task_id, error = %e, "best-effort provider cancel failed");
        }
        let update = JobUpdate::with_error("KIE_CANCELED", "canceled");
        if let Err(e) = self
            .storage
            .update_job_status(&request.job_id, JobStatus::Canceled, update)
            .await
        {
            warn!(job_id = %request.job_id, error = %e, "failed to persist cancel");
        }
        if let Err(e) = self.dedupe.delete(dedupe_key).await {
            warn!(error = %e, "failed to delete dedupe entry on cancel");
        }
        if let Err(e) = self.dedupe.delete_job_task(&request.job_id).await {
            warn!(error = %e, "failed to delete job/task index on cancel");
        }
        observability::record_job_outcome(&request.model_id, "canceled");
        info!(
            action = "KIE_CANCEL",
            correlation_id = %request.correlation_id,
            task_id = %task_id,
            job_id = %request.job_id,
            "generation canceled"
        );
        Err(GenerationError::Canceled)
    }
}

fn cancel_requested(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Transient poll failures keep the loop alive; everything else is fatal.
fn poll_retryable(error: &KieError) -> bool {
    error.is_retryable()
        || matches!(error, KieError::CircuitOpen { .. })
        || matches!(error, KieError::Unknown { status: 408, .. })
}

fn delay_with_jitter(delay: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.0..(delay.as_secs_f64() * 0.2).max(0.001));
    delay + Duration::from_secs_f64(jitter)
}

/// Sleep for `duration`, returning early with `true` when cancellation is
/// signalled.
async fn sleep_or_cancel(cancel: &mut Option<watch::Receiver<bool>>, duration: Duration) -> bool {
    let Some(rx) = cancel.as_mut() else {
        tokio::time::sleep(duration).await;
        return false;
    };
    if *rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = rx.changed() => match changed {
            Ok(()) => *rx.borrow(),
            Err(_) => {
                // Sender dropped: no further cancellation possible.
                *cancel = None;
                false
            }
        },
    }
}
