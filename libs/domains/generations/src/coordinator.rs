//! Submission coordination: collapse duplicate requests before they reach
//! the provider.
//!
//! Order of defenses: the in-process request tracker (fast repeat clicks),
//! the dedupe store (cross-process, TTL-bound), and the per-key lock under
//! which the reservation is written. At most one `create_task` happens for
//! identical `(user, model, fingerprint)` within the dedupe TTL.

use distributed_lock::{LockManager, LockOptions};
use domain_catalog::ModelCatalog;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::dedupe::{DedupeKey, DedupeStatus, DedupeStore};
use crate::engine::{GenerationRequest, JobEngine, ProgressSink, WaitingTimeoutHandler};
use crate::error::{GenerationError, GenerationResult};
use crate::fingerprint::prompt_fingerprint;
use crate::result::JobResult;
use crate::tracker::RequestTracker;

/// A user-facing submission.
pub struct SubmitRequest {
    pub user_id: i64,
    pub model_id: String,
    pub params: Value,
    /// Externally supplied idempotency token; generated when absent
    pub request_id: Option<String>,
    pub sku_id: Option<String>,
    pub cancel: Option<watch::Receiver<bool>>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub on_waiting_timeout: Option<Arc<dyn WaitingTimeoutHandler>>,
}

impl SubmitRequest {
    pub fn new(user_id: i64, model_id: impl Into<String>, params: Value) -> Self {
        Self {
            user_id,
            model_id: model_id.into(),
            params,
            request_id: None,
            sku_id: None,
            cancel: None,
            progress: None,
            on_waiting_timeout: None,
        }
    }

    pub fn with_sku(mut self, sku_id: impl Into<String>) -> Self {
        self.sku_id = Some(sku_id.into());
        self
    }
}

/// Outcome of a submission.
pub enum SubmitOutcome {
    /// This call owned the generation and ran it to completion.
    Completed {
        job_id: String,
        result: Box<JobResult>,
    },
    /// Collapsed onto an in-flight or recent identical request.
    Deduped {
        job_id: Option<String>,
        task_id: Option<String>,
        status: DedupeStatus,
    },
}

pub struct GenerationCoordinator {
    engine: Arc<JobEngine>,
    dedupe: Arc<dyn DedupeStore>,
    tracker: Arc<RequestTracker>,
    locks: LockManager,
    catalog: Arc<ModelCatalog>,
}

impl GenerationCoordinator {
    pub fn new(
        engine: Arc<JobEngine>,
        dedupe: Arc<dyn DedupeStore>,
        tracker: Arc<RequestTracker>,
        locks: LockManager,
        catalog: Arc<ModelCatalog>,
    ) -> Self {
        Self {
            engine,
            dedupe,
            tracker,
            locks,
            catalog,
        }
    }

    fn resolve_price(&self, model_id: &str, sku_id: Option<&str>) -> GenerationResult<(Decimal, bool)> {
        let spec = self
            .catalog
            .get(model_id)
            .ok_or_else(|| GenerationError::ModelNotFound(model_id.to_string()))?;
        match sku_id {
            Some(sku_id) => {
                let price = spec.price_for_sku(sku_id).ok_or(GenerationError::Validation {
                    code: "PRICING_NOT_FOUND",
                    message: format!("No pricing row for SKU '{sku_id}'"),
                })?;
                Ok((price, spec.free))
            }
            None => Ok((Decimal::ZERO, spec.free)),
        }
    }

    /// Submit one generation, collapsing duplicates.
    pub async fn submit(&self, mut submit: SubmitRequest) -> GenerationResult<SubmitOutcome> {
        let fingerprint = prompt_fingerprint(&submit.model_id, &submit.params);
        let key = DedupeKey::new(submit.user_id, submit.model_id.clone(), fingerprint.clone());

        // Fast path: rapid duplicate clicks within one process.
        if let Some(tracked) = self.tracker.get(&key) {
            info!(
                action = "GEN_DEDUPE",
                user_id = submit.user_id,
                model_id = %submit.model_id,
                job_id = %tracked.job_id,
                source = "tracker",
                "duplicate submission collapsed"
            );
            return Ok(SubmitOutcome::Deduped {
                job_id: Some(tracked.job_id),
                task_id: tracked.task_id,
                status: DedupeStatus::Deduped,
            });
        }

        // Cross-process dedupe window.
        if let Some(entry) = self.dedupe.get(&key).await? {
            if entry.status.blocks_resubmit() {
                info!(
                    action = "GEN_DEDUPE",
                    user_id = submit.user_id,
                    model_id = %submit.model_id,
                    job_id = entry.job_id.as_deref().unwrap_or("-"),
                    source = "store",
                    "duplicate submission collapsed"
                );
                return Ok(SubmitOutcome::Deduped {
                    job_id: entry.job_id,
                    task_id: entry.task_id,
                    status: DedupeStatus::Deduped,
                });
            }
        }

        let (price, free) = self.resolve_price(&submit.model_id, submit.sku_id.as_deref())?;

        // Reservation happens under the per-key lock; the generation itself
        // runs after release (the lock TTL is far shorter than a job).
        let request = {
            let guard = self
                .locks
                .acquire(
                    &format!("gen:{}", key.raw()),
                    LockOptions::default()
                        .with_ttl(Duration::from_secs(10))
                        .with_wait(Duration::from_secs(2)),
                )
                .await?;

            if let Some(entry) = self.dedupe.get(&key).await? {
                if entry.status.blocks_resubmit() {
                    guard.release().await;
                    return Ok(SubmitOutcome::Deduped {
                        job_id: entry.job_id,
                        task_id: entry.task_id,
                        status: DedupeStatus::Deduped,
                    });
                }
            }

            let mut request = GenerationRequest::new(
                submit.user_id,
                submit.model_id.clone(),
                submit.params.clone(),
            );
            request.request_id = submit
                .request_id
                .take()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            request.prompt_fingerprint = fingerprint.clone();
            request.price = price;
            request.sku_id = submit.sku_id.clone();
            request.free = free;
            request.cancel = submit.cancel.take();
            request.progress = submit.progress.take();
            request.on_waiting_timeout = submit.on_waiting_timeout.take();

            {
                let job_id = request.job_id.clone();
                let request_id = request.request_id.clone();
                self.dedupe
                    .update(
                        &key,
                        Box::new(move |entry| {
                            entry.status = DedupeStatus::CreateStart;
                            entry.job_id = Some(job_id);
                            entry.request_id = Some(request_id);
                            entry.task_id = None;
                            entry.recovery_attempts = 0;
                            entry.orphan_notified_ts = 0.0;
                        }),
                    )
                    .await?;
            }
            self.tracker.set(key.clone(), request.job_id.clone());
            guard.release().await;
            request
        };

        let job_id = request.job_id.clone();
        let result = self.engine.run_generation(request).await?;
        self.tracker
            .update_task_id(&key, Some(result.task_id.as_str()));
        Ok(SubmitOutcome::Completed {
            job_id,
            result: Box::new(result),
        })
    }
}
