//! Delivery orchestration around one job: reserve the delivery record, run
//! the pipeline, finalize the record, and commit the post-delivery charge.

use async_trait::async_trait;
use domain_generations::JobResult;
use observability::delivery::DeliveryMetrics;
use std::sync::Arc;
use storage::{JobRecord, JobStatus, JobUpdate, StorageHandle};
use tracing::{error, info, warn};

use crate::error::DeliveryResult;
use crate::pipeline::DeliveryPipeline;
use crate::records::{finalize_delivery, reserve_delivery};

/// Billing seam invoked exactly once after a successful delivery.
#[async_trait]
pub trait ChargeCommitter: Send + Sync {
    async fn commit_post_delivery_charge(&self, job: &JobRecord) -> Result<(), String>;
}

pub struct DeliveryService {
    pipeline: Arc<DeliveryPipeline>,
    storage: StorageHandle,
    metrics: Arc<DeliveryMetrics>,
    charger: Option<Arc<dyn ChargeCommitter>>,
}

impl DeliveryService {
    pub fn new(
        pipeline: Arc<DeliveryPipeline>,
        storage: StorageHandle,
        metrics: Arc<DeliveryMetrics>,
        charger: Option<Arc<dyn ChargeCommitter>>,
    ) -> Self {
        Self {
            pipeline,
            storage,
            metrics,
            charger,
        }
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// Deliver one completed job to its user and settle billing.
    ///
    /// Returns whether the artifact reached the user. Duplicate calls for
    /// the same `(user, task)` are no-ops once a delivery succeeded.
    pub async fn deliver_job(
        &self,
        job: &JobRecord,
        result: &JobResult,
        caption: Option<&str>,
    ) -> DeliveryResult<bool> {
        let Some(task_id) = job.provider_task_id.as_deref() else {
            warn!(job_id = %job.job_id, "job has no provider task id, skipping delivery");
            return Ok(false);
        };
        let correlation_id = job.request_id.as_deref().unwrap_or(&job.job_id);

        let already_delivered = reserve_delivery(
            self.storage.as_ref(),
            job.user_id,
            task_id,
            Some(&job.job_id),
            Some(&job.model_id),
            job.request_id.as_deref(),
        )
        .await?;
        if already_delivered {
            info!(
                action = "TG_DELIVER",
                job_id = %job.job_id,
                task_id = %task_id,
                "delivery already recorded, skipping"
            );
            return Ok(true);
        }

        let delivered = self
            .pipeline
            .deliver(result, job.user_id, correlation_id, caption, None)
            .await;
        self.metrics.record_delivery_attempt(delivered);

        finalize_delivery(
            self.storage.as_ref(),
            job.user_id,
            task_id,
            delivered,
            if delivered { None } else { Some("delivery_failed") },
            &result.urls,
        )
        .await?;

        if !delivered {
            return Ok(false);
        }

        if let Err(e) = self
            .storage
            .update_job_status(&job.job_id, JobStatus::Delivered, JobUpdate::default())
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "failed to persist delivered status");
        }

        // Billing strictly after delivery; a failure here must never undo
        // the delivery.
        if let Some(charger) = &self.charger {
            if let Err(e) = charger.commit_post_delivery_charge(job).await {
                error!(
                    job_id = %job.job_id,
                    task_id = %task_id,
                    user_id = job.user_id,
                    error = %e,
                    error_code = "BILLING_INVARIANT",
                    "post-delivery charge failed after successful delivery"
                );
            }
        }

        Ok(true)
    }
}
