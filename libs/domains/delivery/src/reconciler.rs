//! Pending-job reconciler: the crash-recovery sweep.
//!
//! Jobs still marked pending/queued/running/timeout are re-polled against
//! the provider. Finished ones are delivered (through the exactly-once
//! delivery record) and charged; failed ones are closed with the provider's
//! failure code. Queue-age and queue-tail alerts fire from here.

use chrono::Utc;
use core_config::reconciler::ReconcilerConfig;
use domain_catalog::ModelCatalog;
use domain_generations::{parse_record_info, ResultValidator, UrlContext};
use kie_client::{ProviderClient, ProviderState};
use std::sync::Arc;
use std::time::Duration;
use storage::{JobRecord, JobStatus, JobUpdate, StorageHandle, StorageError};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::service::DeliveryService;

pub struct PendingReconciler {
    storage: StorageHandle,
    client: Arc<dyn ProviderClient>,
    catalog: Arc<ModelCatalog>,
    validator: Arc<dyn ResultValidator>,
    delivery: Arc<DeliveryService>,
    config: ReconcilerConfig,
    result_cdn_base_url: Option<String>,
}

impl PendingReconciler {
    pub fn new(
        storage: StorageHandle,
        client: Arc<dyn ProviderClient>,
        catalog: Arc<ModelCatalog>,
        validator: Arc<dyn ResultValidator>,
        delivery: Arc<DeliveryService>,
        config: ReconcilerConfig,
        result_cdn_base_url: Option<String>,
    ) -> Self {
        Self {
            storage,
            client,
            catalog,
            validator,
            delivery,
            config,
            result_cdn_base_url,
        }
    }

    /// Perpetual loop with capped exponential backoff on storage failures.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.interval;
        let mut degraded_backoff = Duration::ZERO;
        info!(
            interval_s = self.config.interval.as_secs(),
            batch_limit = self.config.batch_limit,
            "pending reconciler started"
        );
        loop {
            if *shutdown.borrow() {
                info!("pending reconciler stopping");
                return;
            }
            match self.reconcile_once().await {
                Ok(()) => {
                    backoff = self.config.interval;
                    degraded_backoff = Duration::ZERO;
                }
                Err(e) => {
                    degraded_backoff = if degraded_backoff.is_zero() {
                        Duration::from_secs(5)
                    } else {
                        (degraded_backoff * 2).min(Duration::from_secs(60))
                    };
                    backoff = self.config.interval.max(degraded_backoff);
                    warn!(
                        error = %e,
                        delay_s = backoff.as_secs(),
                        error_code = e.code(),
                        "pending reconciler degraded, backing off"
                    );
                }
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One sweep over pending jobs.
    pub async fn reconcile_once(&self) -> Result<(), StorageError> {
        let jobs = self
            .storage
            .list_jobs_by_status(JobStatus::pending_states(), self.config.batch_limit)
            .await?;
        if jobs.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut max_age_seconds: f64 = 0.0;
        for job in &jobs {
            let age_seconds = (now - job.created_at).num_milliseconds() as f64 / 1000.0;
            if age_seconds >= 0.0 {
                self.delivery.metrics().record_pending_age(age_seconds);
                max_age_seconds = max_age_seconds.max(age_seconds);
            }
        }

        if max_age_seconds >= self.config.pending_age_alert.as_secs_f64() {
            warn!(
                max_age_s = max_age_seconds as u64,
                pending_count = jobs.len(),
                "PENDING_QUEUE_AGE_ALERT"
            );
        }
        if jobs.len() >= self.config.queue_tail_alert_threshold {
            warn!(
                pending_count = jobs.len(),
                threshold = self.config.queue_tail_alert_threshold,
                "PENDING_QUEUE_TAIL_ALERT"
            );
        }

        for job in jobs {
            self.reconcile_job(job).await;
        }

        let snapshot = self.delivery.metrics().snapshot();
        info!(
            action = "DELIVERY_METRICS",
            pending_age_p95 = snapshot.pending_age_p95.unwrap_or(-1.0),
            pending_samples = snapshot.pending_samples,
            delivery_success_rate = snapshot.delivery_success_rate.unwrap_or(-1.0),
            delivery_samples = snapshot.delivery_samples,
            "reconciler metrics snapshot"
        );
        Ok(())
    }

    async fn reconcile_job(&self, job: JobRecord) {
        let Some(task_id) = job.provider_task_id.clone() else {
            return;
        };
        let correlation_id = job.request_id.clone().unwrap_or_else(|| job.job_id.clone());

        let record = match self.client.get_task_status(&task_id, &correlation_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "reconciler poll failed, leaving job pending");
                return;
            }
        };

        match record.state {
            ProviderState::Succeeded => {
                self.deliver_recovered_job(&job, &record.to_raw(), &correlation_id)
                    .await;
            }
            ProviderState::Failed => {
                let update = JobUpdate::with_error(
                    record.fail_code.clone().unwrap_or_else(|| "KIE_FAIL_STATE".to_string()),
                    record
                        .failure_message()
                        .unwrap_or("provider reported failure")
                        .to_string(),
                );
                if let Err(e) = self
                    .storage
                    .update_job_status(&job.job_id, JobStatus::Failed, update)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %e, "failed to persist provider failure");
                }
                info!(
                    action = "RECONCILE",
                    job_id = %job.job_id,
                    task_id = %task_id,
                    outcome = "failed",
                    "pending job closed as failed"
                );
            }
            ProviderState::Canceled => {
                let update = JobUpdate::with_error("KIE_CANCELED", "canceled");
                if let Err(e) = self
                    .storage
                    .update_job_status(&job.job_id, JobStatus::Canceled, update)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %e, "failed to persist cancel");
                }
            }
            _ => {
                // Still in flight; the next sweep will look again.
            }
        }
    }

    async fn deliver_recovered_job(
        &self,
        job: &JobRecord,
        raw_record: &serde_json::Value,
        correlation_id: &str,
    ) {
        let Some(spec) = self.catalog.get(&job.model_id) else {
            warn!(model_id = %job.model_id, "missing model spec, cannot deliver recovered job");
            return;
        };

        let ctx = UrlContext {
            base_url: self.result_cdn_base_url.as_deref(),
            provider_base_url: self.client.base_url(),
            record: Some(raw_record),
            correlation_id: Some(correlation_id),
            model_id: Some(&job.model_id),
        };
        let result = match parse_record_info(raw_record, spec.output_media_type, &job.model_id, &ctx)
        {
            Ok(result) => result,
            Err(e) => {
                let update =
                    JobUpdate::with_error(e.error_code().to_string(), e.to_string());
                if let Err(storage_err) = self
                    .storage
                    .update_job_status(&job.job_id, JobStatus::Failed, update)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %storage_err, "failed to persist parse failure");
                }
                return;
            }
        };

        if !result.urls.is_empty() {
            if let Err(e) = self
                .validator
                .validate(&result.urls, Some(result.media_type), correlation_id)
                .await
            {
                let update = JobUpdate::with_error(e.error_code().to_string(), e.to_string());
                if let Err(storage_err) = self
                    .storage
                    .update_job_status(&job.job_id, JobStatus::Failed, update)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %storage_err, "failed to persist validation failure");
                }
                return;
            }
        }

        if let Err(e) = self
            .storage
            .update_job_status(
                &job.job_id,
                JobStatus::Completed,
                JobUpdate::with_result_urls(result.urls.clone()),
            )
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "failed to persist completion");
        }

        match self.delivery.deliver_job(job, &result, None).await {
            Ok(delivered) => {
                info!(
                    action = "RECONCILE",
                    job_id = %job.job_id,
                    delivered,
                    outcome = "recovered",
                    "pending job recovered"
                );
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "recovered delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DeliveryPipeline;
    use crate::transport::{ChatTransport, MediaGroupItem, MediaUpload};
    use async_trait::async_trait;
    use axum::{routing::get, Router};
    use core_config::delivery::DeliveryConfig;
    use domain_catalog::MediaKind;
    use domain_generations::GenerationResult;
    use kie_client::{KieResult, TaskHandle, TaskRecord};
    use observability::delivery::DeliveryMetrics;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use storage::JsonStorage;

    /// Transport double recording every outbound send.
    #[derive(Default)]
    struct RecordingTransport {
        messages: Mutex<Vec<String>>,
        photos: AtomicU32,
        fail_sends: bool,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_message(&self, _chat_id: i64, text: &str) -> crate::DeliveryResult<()> {
            self.messages.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_photo(
            &self,
            _chat_id: i64,
            _upload: MediaUpload,
            _caption: Option<&str>,
        ) -> crate::DeliveryResult<()> {
            if self.fail_sends {
                return Err(crate::DeliveryError::Transport("boom".into()));
            }
            self.photos.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_video(
            &self,
            _chat_id: i64,
            _upload: MediaUpload,
            _caption: Option<&str>,
        ) -> crate::DeliveryResult<()> {
            Ok(())
        }

        async fn send_audio(
            &self,
            _chat_id: i64,
            _upload: MediaUpload,
            _caption: Option<&str>,
        ) -> crate::DeliveryResult<()> {
            Ok(())
        }

        async fn send_voice(
            &self,
            _chat_id: i64,
            _upload: MediaUpload,
            _caption: Option<&str>,
        ) -> crate::DeliveryResult<()> {
            Ok(())
        }

        async fn send_animation(
            &self,
            _chat_id: i64,
            _upload: MediaUpload,
            _caption: Option<&str>,
        ) -> crate::DeliveryResult<()> {
            Ok(())
        }

        async fn send_document(
            &self,
            _chat_id: i64,
            _upload: MediaUpload,
            _caption: Option<&str>,
        ) -> crate::DeliveryResult<()> {
            Ok(())
        }

        async fn send_media_group(
            &self,
            _chat_id: i64,
            items: Vec<MediaGroupItem>,
        ) -> crate::DeliveryResult<()> {
            self.photos.fetch_add(items.len() as u32, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedClient {
        record: TaskRecord,
    }

    #[async_trait]
    impl kie_client::ProviderClient for ScriptedClient {
        async fn create_task(
            &self,
            _model: &str,
            _input: &Value,
            _callback_url: Option<&str>,
            correlation_id: &str,
        ) -> KieResult<TaskHandle> {
            Ok(TaskHandle {
                task_id: self.record.task_id.clone(),
                correlation_id: correlation_id.to_string(),
            })
        }

        async fn get_task_status(
            &self,
            _task_id: &str,
            _correlation_id: &str,
        ) -> KieResult<TaskRecord> {
            Ok(self.record.clone())
        }

        async fn cancel_task(&self, _task_id: &str, _correlation_id: &str) -> KieResult<()> {
            Ok(())
        }

        async fn get_download_url(
            &self,
            source_url: &str,
            _correlation_id: &str,
        ) -> KieResult<String> {
            Ok(source_url.to_string())
        }
    }

    struct NoopValidator;

    #[async_trait]
    impl ResultValidator for NoopValidator {
        async fn validate(
            &self,
            _urls: &[String],
            _media_type: Option<MediaKind>,
            _correlation_id: &str,
        ) -> GenerationResult<()> {
            Ok(())
        }
    }

    struct CountingCharger {
        charges: AtomicU32,
    }

    #[async_trait]
    impl crate::ChargeCommitter for CountingCharger {
        async fn commit_post_delivery_charge(&self, _job: &JobRecord) -> Result<(), String> {
            self.charges.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Serve a one-pixel PNG from a local listener.
    async fn serve_png() -> SocketAddr {
        let png: &[u8] = b"\x89PNG\r\n\x1a\n0123456789abcdef";
        let app = Router::new().route(
            "/img.png",
            get(move || async move {
                (
                    [(axum::http::header::CONTENT_TYPE, "image/png")],
                    png.to_vec(),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(
            ModelCatalog::from_json(json!([
                {"id": "flux/text-to-image", "output_media_type": "image"},
            ]))
            .unwrap(),
        )
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: StorageHandle,
        transport: Arc<RecordingTransport>,
        charger: Arc<CountingCharger>,
        reconciler: PendingReconciler,
    }

    fn fixture(record: TaskRecord) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage: StorageHandle = Arc::new(JsonStorage::new(dir.path(), "default").unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let client: Arc<dyn ProviderClient> = Arc::new(ScriptedClient { record });
        let pipeline = Arc::new(
            DeliveryPipeline::new(
                transport.clone(),
                client.clone(),
                DeliveryConfig::default(),
            )
            .unwrap(),
        );
        let charger = Arc::new(CountingCharger {
            charges: AtomicU32::new(0),
        });
        let delivery = Arc::new(DeliveryService::new(
            pipeline,
            Arc::clone(&storage),
            Arc::new(DeliveryMetrics::new()),
            Some(charger.clone()),
        ));
        let reconciler = PendingReconciler::new(
            Arc::clone(&storage),
            client,
            catalog(),
            Arc::new(NoopValidator),
            delivery,
            ReconcilerConfig::default(),
            None,
        );
        Fixture {
            _dir: dir,
            storage,
            transport,
            charger,
            reconciler,
        }
    }

    async fn seed_timeout_job(storage: &StorageHandle, task_id: &str) -> String {
        let mut job = JobRecord::new(7, "flux/text-to-image");
        job.provider_task_id = Some(task_id.to_string());
        job.status = JobStatus::Timeout;
        job.price = Decimal::new(1000, 2);
        let job_id = job.job_id.clone();
        storage.add_generation_job(job).await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn test_timeout_job_recovered_delivered_and_charged_once() {
        let addr = serve_png().await;
        let url = format!("http://{addr}/img.png");
        let record = TaskRecord {
            task_id: "t-rec".to_string(),
            state: ProviderState::Succeeded,
            state_raw: Some("success".to_string()),
            result_urls: vec![url],
            correlation_id: "corr".to_string(),
            ..TaskRecord::default()
        };
        let fixture = fixture(record);
        let job_id = seed_timeout_job(&fixture.storage, "t-rec").await;

        fixture.reconciler.reconcile_once().await.unwrap();

        let job = fixture.storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delivered);
        assert_eq!(fixture.transport.photos.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.charger.charges.load(Ordering::SeqCst), 1);

        // A second sweep neither re-delivers nor re-charges.
        fixture.reconciler.reconcile_once().await.unwrap();
        assert_eq!(fixture.transport.photos.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.charger.charges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_closes_job_without_charge() {
        let record = TaskRecord {
            task_id: "t-fail".to_string(),
            state: ProviderState::Failed,
            state_raw: Some("failed".to_string()),
            fail_code: Some("E42".to_string()),
            fail_msg: Some("exploded".to_string()),
            correlation_id: "corr".to_string(),
            ..TaskRecord::default()
        };
        let fixture = fixture(record);
        let job_id = seed_timeout_job(&fixture.storage, "t-fail").await;

        fixture.reconciler.reconcile_once().await.unwrap();

        let job = fixture.storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("E42"));
        assert_eq!(fixture.charger.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_still_running_job_left_pending() {
        let record = TaskRecord {
            task_id: "t-run".to_string(),
            state: ProviderState::Running,
            state_raw: Some("generating".to_string()),
            correlation_id: "corr".to_string(),
            ..TaskRecord::default()
        };
        let fixture = fixture(record);
        let job_id = seed_timeout_job(&fixture.storage, "t-run").await;

        fixture.reconciler.reconcile_once().await.unwrap();

        let job = fixture.storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(fixture.charger.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_html_result_fails_without_charge() {
        let addr = {
            let app = Router::new().route(
                "/page",
                get(|| async {
                    (
                        [(axum::http::header::CONTENT_TYPE, "text/html")],
                        "<!doctype html><html><body>login</body></html>".to_string(),
                    )
                }),
            );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            addr
        };
        let record = TaskRecord {
            task_id: "t-html".to_string(),
            state: ProviderState::Succeeded,
            state_raw: Some("success".to_string()),
            result_urls: vec![format!("http://{addr}/page")],
            correlation_id: "corr".to_string(),
            ..TaskRecord::default()
        };
        let fixture = fixture(record);
        seed_timeout_job(&fixture.storage, "t-html").await;

        fixture.reconciler.reconcile_once().await.unwrap();

        // The user got a warning message with the URL, no media, no charge.
        let messages = fixture.transport.messages.lock().unwrap().clone();
        assert!(messages.iter().any(|m| m.contains("web page")));
        assert_eq!(fixture.transport.photos.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.charger.charges.load(Ordering::SeqCst), 0);
    }
}
