use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;

use crate::error::StorageResult;
use crate::models::{HourlyFreeUsage, JobRecord, JobStatus, JobUpdate, PaymentRecord};

/// Read-modify-write closure applied to one JSON document.
pub type JsonUpdater = Box<dyn FnOnce(&mut Value) + Send>;

/// Shared handle used across the engine, reconcilers, and billing.
pub type StorageHandle = Arc<dyn Storage>;

/// Abstract persistence for jobs, delivery records, counters, and balances.
///
/// Counters and balances are mutated only through the atomic operations
/// below; callers never read-modify-write around the façade.
#[async_trait]
pub trait Storage: Send + Sync {
    // --- jobs ---

    async fn add_generation_job(&self, job: JobRecord) -> StorageResult<()>;

    /// Apply a status transition. Transitions out of terminal states are
    /// ignored (and return the stored record unchanged).
    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        update: JobUpdate,
    ) -> StorageResult<JobRecord>;

    async fn get_job(&self, job_id: &str) -> StorageResult<Option<JobRecord>>;

    async fn list_jobs_by_status(
        &self,
        statuses: &[JobStatus],
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>>;

    // --- generic JSON documents (delivery records and friends) ---

    /// Atomically read-modify-write a named JSON document and return the
    /// updated value.
    async fn update_json_file(&self, name: &str, updater: JsonUpdater) -> StorageResult<Value>;

    async fn read_json_file(&self, name: &str) -> StorageResult<Value>;

    // --- free tier ---

    async fn get_hourly_free_usage(&self, user_id: i64) -> StorageResult<HourlyFreeUsage>;

    async fn set_hourly_free_usage(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        used_count: u32,
    ) -> StorageResult<()>;

    async fn get_referral_free_bank(&self, user_id: i64) -> StorageResult<i64>;

    async fn set_referral_free_bank(&self, user_id: i64, value: i64) -> StorageResult<()>;

    // --- balances & payments ---

    async fn get_user_balance(&self, user_id: i64) -> StorageResult<Decimal>;

    async fn set_user_balance(&self, user_id: i64, amount: Decimal) -> StorageResult<()>;

    /// Atomically subtract `amount`; returns `false` (and leaves the balance
    /// untouched) when funds are insufficient.
    async fn subtract_user_balance(&self, user_id: i64, amount: Decimal) -> StorageResult<bool>;

    /// Record a payment; returns `false` when the screenshot id was already
    /// recorded.
    async fn record_payment(&self, payment: PaymentRecord) -> StorageResult<bool>;
}

/// Current epoch timestamp used by JSON document entries.
pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
