//! JSON-file backend: one document per concern under `data/<tenant>/`.
//!
//! Writes go to a temp file and are renamed into place; per-document
//! serialization is provided by a `KeyedMutex`, so read-modify-write cycles
//! are atomic within the process.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use distributed_lock::KeyedMutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::facade::{now_iso, JsonUpdater, Storage};
use crate::models::{HourlyFreeUsage, JobRecord, JobStatus, JobUpdate, PaymentRecord};

const JOBS_FILE: &str = "generations_history.json";
const USERS_FILE: &str = "users.json";
const HOURLY_FILE: &str = "hourly_free_usage.json";
const PAYMENTS_FILE: &str = "payments.json";

pub struct JsonStorage {
    root: PathBuf,
    files: KeyedMutex,
}

impl JsonStorage {
    /// Open (and create) the tenant's data directory.
    pub fn new(data_dir: impl AsRef<Path>, tenant: &str) -> StorageResult<Self> {
        let root = data_dir.as_ref().join(tenant);
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::WriteFail(format!("create {}: {e}", root.display())))?;
        Ok(Self {
            root,
            files: KeyedMutex::new(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn read_doc(&self, name: &str) -> StorageResult<Value> {
        let path = self.path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| StorageError::ReadFail(format!("{name}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(json!({})),
            Err(e) => Err(StorageError::ReadFail(format!("{name}: {e}"))),
        }
    }

    async fn write_doc(&self, name: &str, value: &Value) -> StorageResult<()> {
        let path = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));
        let raw = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| StorageError::WriteFail(format!("{name}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::WriteFail(format!("{name}: {e}")))?;
        debug!(file = %name, "storage document written");
        Ok(())
    }

    /// Read-modify-write one user entry inside `users.json`.
    async fn update_user<R>(
        &self,
        user_id: i64,
        mutate: impl FnOnce(&mut Value) -> R,
    ) -> StorageResult<R> {
        let _guard = self.files.acquire(USERS_FILE).await;
        let mut doc = self.read_doc(USERS_FILE).await?;
        let key = user_id.to_string();
        if !doc.get(&key).is_some_and(Value::is_object) {
            doc[&key] = json!({});
        }
        let result = mutate(doc.get_mut(&key).expect("user entry just ensured"));
        self.write_doc(USERS_FILE, &doc).await?;
        Ok(result)
    }

    fn balance_of(entry: &Value) -> Decimal {
        entry
            .get("balance")
            .and_then(Value::as_str)
            .and_then(|raw| Decimal::from_str(raw).ok())
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn add_generation_job(&self, job: JobRecord) -> StorageResult<()> {
        let _guard = self.files.acquire(JOBS_FILE).await;
        let mut doc = self.read_doc(JOBS_FILE).await?;
        doc[job.job_id.clone()] = serde_json::to_value(&job)?;
        self.write_doc(JOBS_FILE, &doc).await
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        update: JobUpdate,
    ) -> StorageResult<JobRecord> {
        let _guard = self.files.acquire(JOBS_FILE).await;
        let mut doc = self.read_doc(JOBS_FILE).await?;
        let entry = doc
            .get(job_id)
            .cloned()
            .ok_or_else(|| StorageError::JobNotFound(job_id.to_string()))?;
        let mut job: JobRecord = serde_json::from_value(entry)?;
        if update.apply(&mut job, status) {
            doc[job_id] = serde_json::to_value(&job)?;
            self.write_doc(JOBS_FILE, &doc).await?;
        }
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> StorageResult<Option<JobRecord>> {
        let doc = self.read_doc(JOBS_FILE).await?;
        match doc.get(job_id) {
            Some(entry) => Ok(Some(serde_json::from_value(entry.clone())?)),
            None => Ok(None),
        }
    }

    async fn list_jobs_by_status(
        &self,
        statuses: &[JobStatus],
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>> {
        let doc = self.read_doc(JOBS_FILE).await?;
        let mut jobs: Vec<JobRecord> = doc
            .as_object()
            .map(|entries| {
                entries
                    .values()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .filter(|job: &JobRecord| statuses.contains(&job.status))
                    .collect()
            })
            .unwrap_or_default();
        jobs.sort_by_key(|job| job.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn update_json_file(&self, name: &str, updater: JsonUpdater) -> StorageResult<Value> {
        let _guard = self.files.acquire(name).await;
        let mut doc = self.read_doc(name).await?;
        updater(&mut doc);
        self.write_doc(name, &doc).await?;
        Ok(doc)
    }

    async fn read_json_file(&self, name: &str) -> StorageResult<Value> {
        self.read_doc(name).await
    }

    async fn get_hourly_free_usage(&self, user_id: i64) -> StorageResult<HourlyFreeUsage> {
        let doc = self.read_doc(HOURLY_FILE).await?;
        let usage: HourlyFreeUsage = doc
            .get(user_id.to_string())
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        // The hourly window slides on read.
        match usage.window_start {
            Some(window_start) if Utc::now() - window_start < ChronoDuration::hours(1) => Ok(usage),
            _ => Ok(HourlyFreeUsage::default()),
        }
    }

    async fn set_hourly_free_usage(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        used_count: u32,
    ) -> StorageResult<()> {
        let _guard = self.files.acquire(HOURLY_FILE).await;
        let mut doc = self.read_doc(HOURLY_FILE).await?;
        doc[user_id.to_string()] = serde_json::to_value(HourlyFreeUsage {
            window_start: Some(window_start),
            used_count,
        })?;
        self.write_doc(HOURLY_FILE, &doc).await
    }

    async fn get_referral_free_bank(&self, user_id: i64) -> StorageResult<i64> {
        let doc = self.read_doc(USERS_FILE).await?;
        Ok(doc
            .get(user_id.to_string())
            .and_then(|entry| entry.get("referral_free_bank"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    async fn set_referral_free_bank(&self, user_id: i64, value: i64) -> StorageResult<()> {
        self.update_user(user_id, |entry| {
            entry["referral_free_bank"] = json!(value.max(0));
        })
        .await
    }

    async fn get_user_balance(&self, user_id: i64) -> StorageResult<Decimal> {
        let doc = self.read_doc(USERS_FILE).await?;
        Ok(doc
            .get(user_id.to_string())
            .map(Self::balance_of)
            .unwrap_or(Decimal::ZERO))
    }

    async fn set_user_balance(&self, user_id: i64, amount: Decimal) -> StorageResult<()> {
        self.update_user(user_id, |entry| {
            entry["balance"] = json!(amount.to_string());
        })
        .await
    }

    async fn subtract_user_balance(&self, user_id: i64, amount: Decimal) -> StorageResult<bool> {
        self.update_user(user_id, |entry| {
            let balance = Self::balance_of(entry);
            if balance < amount {
                return false;
            }
            entry["balance"] = json!((balance - amount).to_string());
            true
        })
        .await
    }

    async fn record_payment(&self, payment: PaymentRecord) -> StorageResult<bool> {
        let _guard = self.files.acquire(PAYMENTS_FILE).await;
        let mut doc = self.read_doc(PAYMENTS_FILE).await?;
        if doc.get(&payment.screenshot_id).is_some() {
            return Ok(false);
        }
        doc[payment.screenshot_id.clone()] = json!({
            "user_id": payment.user_id,
            "amount": payment.amount.to_string(),
            "screenshot_id": payment.screenshot_id,
            "created_at": payment.created_at.to_rfc3339(),
            "recorded_at": now_iso(),
        });
        self.write_doc(PAYMENTS_FILE, &doc).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, JsonStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path(), "default").unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let (_dir, storage) = storage();
        let mut job = JobRecord::new(7, "flux-2/pro-text-to-image");
        job.prompt = Some("cat".into());
        let job_id = job.job_id.clone();
        storage.add_generation_job(job).await.unwrap();

        let loaded = storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, 7);
        assert_eq!(loaded.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn test_update_job_status_and_terminal_guard() {
        let (_dir, storage) = storage();
        let job = JobRecord::new(7, "m");
        let job_id = job.job_id.clone();
        storage.add_generation_job(job).await.unwrap();

        let updated = storage
            .update_job_status(&job_id, JobStatus::Queued, JobUpdate::with_task_id("t-1"))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Queued);
        assert_eq!(updated.provider_task_id.as_deref(), Some("t-1"));

        storage
            .update_job_status(&job_id, JobStatus::Failed, JobUpdate::default())
            .await
            .unwrap();
        let after = storage
            .update_job_status(&job_id, JobStatus::Running, JobUpdate::default())
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_list_jobs_by_status_ordered_and_limited() {
        let (_dir, storage) = storage();
        for _ in 0..3 {
            let mut job = JobRecord::new(1, "m");
            job.status = JobStatus::Queued;
            storage.add_generation_job(job).await.unwrap();
        }
        let mut done = JobRecord::new(1, "m");
        done.status = JobStatus::Delivered;
        storage.add_generation_job(done).await.unwrap();

        let pending = storage
            .list_jobs_by_status(JobStatus::pending_states(), 2)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].created_at <= pending[1].created_at);
    }

    #[tokio::test]
    async fn test_update_json_file_round_trip() {
        let (_dir, storage) = storage();
        let updated = storage
            .update_json_file(
                "delivery_records.json",
                Box::new(|doc| {
                    doc["1:t-1"] = json!({"status": "delivering", "attempts": 1});
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated["1:t-1"]["attempts"], 1);

        let read_back = storage.read_json_file("delivery_records.json").await.unwrap();
        assert_eq!(read_back["1:t-1"]["status"], "delivering");
    }

    #[tokio::test]
    async fn test_balance_subtract_insufficient() {
        let (_dir, storage) = storage();
        storage
            .set_user_balance(9, Decimal::from_str("10.00").unwrap())
            .await
            .unwrap();

        let ok = storage
            .subtract_user_balance(9, Decimal::from_str("4.00").unwrap())
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(
            storage.get_user_balance(9).await.unwrap(),
            Decimal::from_str("6.00").unwrap()
        );

        let denied = storage
            .subtract_user_balance(9, Decimal::from_str("100.00").unwrap())
            .await
            .unwrap();
        assert!(!denied);
        assert_eq!(
            storage.get_user_balance(9).await.unwrap(),
            Decimal::from_str("6.00").unwrap()
        );
    }

    #[tokio::test]
    async fn test_hourly_window_slides_on_read() {
        let (_dir, storage) = storage();
        let stale_start = Utc::now() - ChronoDuration::hours(2);
        storage.set_hourly_free_usage(3, stale_start, 5).await.unwrap();

        let usage = storage.get_hourly_free_usage(3).await.unwrap();
        assert_eq!(usage.used_count, 0);
        assert!(usage.window_start.is_none());

        let fresh_start = Utc::now();
        storage.set_hourly_free_usage(3, fresh_start, 2).await.unwrap();
        let usage = storage.get_hourly_free_usage(3).await.unwrap();
        assert_eq!(usage.used_count, 2);
    }

    #[tokio::test]
    async fn test_referral_bank_never_negative() {
        let (_dir, storage) = storage();
        storage.set_referral_free_bank(4, -3).await.unwrap();
        assert_eq!(storage.get_referral_free_bank(4).await.unwrap(), 0);
        storage.set_referral_free_bank(4, 7).await.unwrap();
        assert_eq!(storage.get_referral_free_bank(4).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_payment_screenshot_idempotency() {
        let (_dir, storage) = storage();
        let payment = PaymentRecord {
            user_id: 5,
            amount: Decimal::from_str("100.00").unwrap(),
            screenshot_id: "shot-1".into(),
            created_at: Utc::now(),
        };
        assert!(storage.record_payment(payment.clone()).await.unwrap());
        assert!(!storage.record_payment(payment).await.unwrap());
    }
}
