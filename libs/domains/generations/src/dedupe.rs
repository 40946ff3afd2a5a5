//! Request deduplication store.
//!
//! Maps `(user, model, prompt_fingerprint)` to the in-flight or recent job
//! state so identical submissions collapse onto one provider task. Redis
//! backend for multi-instance deployments, in-memory fallback otherwise.
//! Writers serialize through the per-key generation lock; the store itself
//! is a plain last-write-wins KV with TTL.

use async_trait::async_trait;
use chrono::Utc;
use core_config::tenant::TenantId;
use domain_catalog::MediaKind;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum DedupeError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DedupeResult<T> = Result<T, DedupeError>;

/// Canonical dedupe entry status.
///
/// The storage layer accepts the historical spellings (`create_start`,
/// `task_created`, ...) and this enum is the single vocabulary used in code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DedupeStatus {
    #[default]
    CreateStart,
    TaskCreated,
    Deduped,
    Pending,
    Queued,
    Waiting,
    Running,
    Succeeded,
    Completed,
    Delivered,
    Failed,
    Canceled,
}

impl DedupeStatus {
    /// States a missing-task-id entry may legitimately sit in before the
    /// orphan reconciler considers it stuck.
    pub fn is_orphan_candidate(self) -> bool {
        matches!(
            self,
            Self::CreateStart
                | Self::TaskCreated
                | Self::Deduped
                | Self::Pending
                | Self::Queued
                | Self::Waiting
                | Self::Running
                | Self::Succeeded
        )
    }

    /// Whether a new identical submission should collapse onto this entry.
    pub fn blocks_resubmit(self) -> bool {
        !matches!(self, Self::Failed | Self::Canceled)
    }
}

/// Identity of one dedupe slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub user_id: i64,
    pub model_id: String,
    pub prompt_fingerprint: String,
}

impl DedupeKey {
    pub fn new(user_id: i64, model_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            user_id,
            model_id: model_id.into(),
            prompt_fingerprint: fingerprint.into(),
        }
    }

    pub fn raw(&self) -> String {
        format!(
            "gen_dedupe:{}:{}:{}",
            self.user_id, self.model_id, self.prompt_fingerprint
        )
    }
}

/// One dedupe slot value; flat record, epoch-second timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeEntry {
    pub user_id: i64,
    pub model_id: String,
    pub prompt_fingerprint: String,
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: DedupeStatus,
    pub request_id: Option<String>,
    pub media_type: Option<MediaKind>,
    #[serde(default)]
    pub result_urls: Vec<String>,
    pub result_text: Option<String>,
    #[serde(default)]
    pub updated_ts: f64,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub last_recovery_ts: f64,
    #[serde(default)]
    pub orphan_notified_ts: f64,
}

impl DedupeEntry {
    pub fn new(key: &DedupeKey) -> Self {
        Self {
            user_id: key.user_id,
            model_id: key.model_id.clone(),
            prompt_fingerprint: key.prompt_fingerprint.clone(),
            job_id: None,
            task_id: None,
            status: DedupeStatus::CreateStart,
            request_id: None,
            media_type: None,
            result_urls: Vec::new(),
            result_text: None,
            updated_ts: 0.0,
            recovery_attempts: 0,
            last_recovery_ts: 0.0,
            orphan_notified_ts: 0.0,
        }
    }

    pub fn key(&self) -> DedupeKey {
        DedupeKey::new(self.user_id, self.model_id.clone(), self.prompt_fingerprint.clone())
    }

    pub fn age_seconds(&self, now_ts: f64) -> f64 {
        if self.updated_ts <= 0.0 {
            f64::INFINITY
        } else {
            (now_ts - self.updated_ts).max(0.0)
        }
    }
}

pub(crate) fn epoch_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

/// Read-modify-write closure applied to one entry.
pub type EntryMutator = Box<dyn FnOnce(&mut DedupeEntry) + Send>;

/// Keyed store of dedupe entries plus two secondary indices:
/// `request_id -> key` and `job_id -> task_id`.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    async fn get(&self, key: &DedupeKey) -> DedupeResult<Option<DedupeEntry>>;

    /// Write the entry (stamping `updated_ts`) and its request-id index.
    async fn set(&self, entry: DedupeEntry) -> DedupeResult<DedupeEntry>;

    /// Read-modify-write; a fresh entry is created when the key is absent.
    async fn update(&self, key: &DedupeKey, mutate: EntryMutator) -> DedupeResult<DedupeEntry>;

    async fn delete(&self, key: &DedupeKey) -> DedupeResult<()>;

    /// Scan up to `limit` entries; used by the orphan reconciler.
    async fn list(&self, limit: usize) -> DedupeResult<Vec<DedupeEntry>>;

    async fn get_by_request_id(&self, request_id: &str) -> DedupeResult<Option<DedupeEntry>>;

    async fn set_job_task(&self, job_id: &str, task_id: Option<&str>) -> DedupeResult<()>;

    async fn task_id_for_job(&self, job_id: &str) -> DedupeResult<Option<String>>;

    async fn delete_job_task(&self, job_id: &str) -> DedupeResult<()>;
}

#[derive(Serialize, Deserialize)]
struct RequestMapping {
    user_id: i64,
    model_id: String,
    prompt_fingerprint: String,
    updated_ts: f64,
}

#[derive(Serialize, Deserialize)]
struct JobTaskMapping {
    job_id: String,
    task_id: Option<String>,
    updated_ts: f64,
}

// --- in-memory backend ---

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, (DedupeEntry, Instant)>,
    request_map: HashMap<String, (DedupeKey, Instant)>,
    job_tasks: HashMap<String, (Option<String>, Instant)>,
}

/// In-process fallback store with monotonic expiry.
pub struct MemoryDedupeStore {
    tenant: TenantId,
    ttl: Duration,
    inner: Mutex<MemoryInner>,
}

impl MemoryDedupeStore {
    pub fn new(tenant: TenantId, ttl: Duration) -> Self {
        Self {
            tenant,
            ttl,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn entry_key(&self, key: &DedupeKey) -> String {
        self.tenant.scoped_key(&key.raw())
    }

    fn request_key(&self, request_id: &str) -> String {
        self.tenant.scoped_key(&format!("gen_request:{request_id}"))
    }

    fn job_key(&self, job_id: &str) -> String {
        self.tenant.scoped_key(&format!("gen_job_task:{job_id}"))
    }
}

#[async_trait]
impl DedupeStore for MemoryDedupeStore {
    async fn get(&self, key: &DedupeKey) -> DedupeResult<Option<DedupeEntry>> {
        let mut inner = self.inner.lock().expect("dedupe map poisoned");
        let map_key = self.entry_key(key);
        let expired = matches!(
            inner.entries.get(&map_key),
            Some((_, expires)) if Instant::now() > *expires
        );
        if expired {
            inner.entries.remove(&map_key);
            return Ok(None);
        }
        Ok(inner.entries.get(&map_key).map(|(entry, _)| entry.clone()))
    }

    async fn set(&self, mut entry: DedupeEntry) -> DedupeResult<DedupeEntry> {
        entry.updated_ts = epoch_seconds();
        let expires = Instant::now() + self.ttl;
        let mut inner = self.inner.lock().expect("dedupe map poisoned");
        inner
            .entries
            .insert(self.entry_key(&entry.key()), (entry.clone(), expires));
        if let Some(request_id) = &entry.request_id {
            inner
                .request_map
                .insert(self.request_key(request_id), (entry.key(), expires));
        }
        Ok(entry)
    }

    async fn update(&self, key: &DedupeKey, mutate: EntryMutator) -> DedupeResult<DedupeEntry> {
        let mut entry = self
            .get(key)
            .await?
            .unwrap_or_else(|| DedupeEntry::new(key));
        mutate(&mut entry);
        self.set(entry).await
    }

    async fn delete(&self, key: &DedupeKey) -> DedupeResult<()> {
        let mut inner = self.inner.lock().expect("dedupe map poisoned");
        let map_key = self.entry_key(key);
        inner.entries.remove(&map_key);
        Ok(())
    }

    async fn list(&self, limit: usize) -> DedupeResult<Vec<DedupeEntry>> {
        let mut inner = self.inner.lock().expect("dedupe map poisoned");
        let now = Instant::now();
        inner.entries.retain(|_, (_, expires)| now <= *expires);
        Ok(inner
            .entries
            .values()
            .take(limit)
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn get_by_request_id(&self, request_id: &str) -> DedupeResult<Option<DedupeEntry>> {
        let key = {
            let inner = self.inner.lock().expect("dedupe map poisoned");
            match inner.request_map.get(&self.request_key(request_id)) {
                Some((_, expires)) if Instant::now() > *expires => None,
                Some((key, _)) => Some(key.clone()),
                None => None,
            }
        };
        match key {
            Some(key) => self.get(&key).await,
            None => Ok(None),
        }
    }

    async fn set_job_task(&self, job_id: &str, task_id: Option<&str>) -> DedupeResult<()> {
        let mut inner = self.inner.lock().expect("dedupe map poisoned");
        inner.job_tasks.insert(
            self.job_key(job_id),
            (task_id.map(str::to_string), Instant::now() + self.ttl),
        );
        Ok(())
    }

    async fn task_id_for_job(&self, job_id: &str) -> DedupeResult<Option<String>> {
        let mut inner = self.inner.lock().expect("dedupe map poisoned");
        let map_key = self.job_key(job_id);
        let expired = matches!(
            inner.job_tasks.get(&map_key),
            Some((_, expires)) if Instant::now() > *expires
        );
        if expired {
            inner.job_tasks.remove(&map_key);
            return Ok(None);
        }
        Ok(inner
            .job_tasks
            .get(&map_key)
            .and_then(|(task_id, _)| task_id.clone()))
    }

    async fn delete_job_task(&self, job_id: &str) -> DedupeResult<()> {
        let mut inner = self.inner.lock().expect("dedupe map poisoned");
        let map_key = self.job_key(job_id);
        inner.job_tasks.remove(&map_key);
        Ok(())
    }
}

// --- Redis backend ---

/// Redis-backed store: `SET key value EX ttl` per entry, `SCAN` for the
/// reconciler listing.
pub struct RedisDedupeStore {
    redis: ConnectionManager,
    tenant: TenantId,
    ttl: Duration,
}

impl RedisDedupeStore {
    pub fn new(redis: ConnectionManager, tenant: TenantId, ttl: Duration) -> Self {
        Self { redis, tenant, ttl }
    }

    fn entry_key(&self, key: &DedupeKey) -> String {
        self.tenant.scoped_key(&key.raw())
    }

    fn request_key(&self, request_id: &str) -> String {
        self.tenant.scoped_key(&format!("gen_request:{request_id}"))
    }

    fn job_key(&self, job_id: &str) -> String {
        self.tenant.scoped_key(&format!("gen_job_task:{job_id}"))
    }

    async fn get_raw(&self, key: &str) -> DedupeResult<Option<String>> {
        let mut conn = self.redis.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set_raw(&self, key: &str, value: &str) -> DedupeResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DedupeStore for RedisDedupeStore {
    async fn get(&self, key: &DedupeKey) -> DedupeResult<Option<DedupeEntry>> {
        match self.get_raw(&self.entry_key(key)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    async fn set(&self, mut entry: DedupeEntry) -> DedupeResult<DedupeEntry> {
        entry.updated_ts = epoch_seconds();
        self.set_raw(
            &self.entry_key(&entry.key()),
            &serde_json::to_string(&entry)?,
        )
        .await?;
        if let Some(request_id) = entry.request_id.clone() {
            let mapping = RequestMapping {
                user_id: entry.user_id,
                model_id: entry.model_id.clone(),
                prompt_fingerprint: entry.prompt_fingerprint.clone(),
                updated_ts: entry.updated_ts,
            };
            self.set_raw(
                &self.request_key(&request_id),
                &serde_json::to_string(&mapping)?,
            )
            .await?;
        }
        Ok(entry)
    }

    async fn update(&self, key: &DedupeKey, mutate: EntryMutator) -> DedupeResult<DedupeEntry> {
        let mut entry = self
            .get(key)
            .await?
            .unwrap_or_else(|| DedupeEntry::new(key));
        mutate(&mut entry);
        self.set(entry).await
    }

    async fn delete(&self, key: &DedupeKey) -> DedupeResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(self.entry_key(key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> DedupeResult<Vec<DedupeEntry>> {
        let pattern = self.tenant.scoped_key("gen_dedupe:*");
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut entries = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            for key in keys {
                if let Some(raw) = self.get_raw(&key).await? {
                    if let Ok(entry) = serde_json::from_str::<DedupeEntry>(&raw) {
                        entries.push(entry);
                        if entries.len() >= limit {
                            return Ok(entries);
                        }
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(entries)
    }

    async fn get_by_request_id(&self, request_id: &str) -> DedupeResult<Option<DedupeEntry>> {
        let Some(raw) = self.get_raw(&self.request_key(request_id)).await? else {
            return Ok(None);
        };
        let Ok(mapping) = serde_json::from_str::<RequestMapping>(&raw) else {
            return Ok(None);
        };
        self.get(&DedupeKey::new(
            mapping.user_id,
            mapping.model_id,
            mapping.prompt_fingerprint,
        ))
        .await
    }

    async fn set_job_task(&self, job_id: &str, task_id: Option<&str>) -> DedupeResult<()> {
        let mapping = JobTaskMapping {
            job_id: job_id.to_string(),
            task_id: task_id.map(str::to_string),
            updated_ts: epoch_seconds(),
        };
        self.set_raw(&self.job_key(job_id), &serde_json::to_string(&mapping)?)
            .await
    }

    async fn task_id_for_job(&self, job_id: &str) -> DedupeResult<Option<String>> {
        let Some(raw) = self.get_raw(&self.job_key(job_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str::<JobTaskMapping>(&raw)
            .ok()
            .and_then(|mapping| mapping.task_id))
    }

    async fn delete_job_task(&self, job_id: &str) -> DedupeResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(self.job_key(job_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryDedupeStore {
        MemoryDedupeStore::new(TenantId::new("test"), Duration::from_secs(3600))
    }

    fn key() -> DedupeKey {
        DedupeKey::new(7, "flux-2/pro-text-to-image", "abcd1234abcd1234")
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let store = store();
        let mut entry = DedupeEntry::new(&key());
        entry.job_id = Some("job-1".into());
        entry.status = DedupeStatus::Queued;
        let stored = store.set(entry).await.unwrap();
        assert!(stored.updated_ts > 0.0);

        let loaded = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(loaded.job_id.as_deref(), Some("job-1"));
        assert_eq!(loaded.status, DedupeStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_creates_when_absent() {
        let store = store();
        let entry = store
            .update(
                &key(),
                Box::new(|entry| {
                    entry.status = DedupeStatus::TaskCreated;
                    entry.task_id = Some("t-1".into());
                }),
            )
            .await
            .unwrap();
        assert_eq!(entry.status, DedupeStatus::TaskCreated);
        assert_eq!(entry.task_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryDedupeStore::new(TenantId::new("test"), Duration::from_millis(10));
        store.set(DedupeEntry::new(&key())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get(&key()).await.unwrap().is_none());
        assert!(store.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        store.set(DedupeEntry::new(&key())).await.unwrap();
        store.delete(&key()).await.unwrap();
        assert!(store.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_id_index() {
        let store = store();
        let mut entry = DedupeEntry::new(&key());
        entry.request_id = Some("req-9".into());
        store.set(entry).await.unwrap();

        let by_request = store.get_by_request_id("req-9").await.unwrap().unwrap();
        assert_eq!(by_request.prompt_fingerprint, key().prompt_fingerprint);
        assert!(store.get_by_request_id("req-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_task_index() {
        let store = store();
        store.set_job_task("job-1", Some("t-1")).await.unwrap();
        assert_eq!(
            store.task_id_for_job("job-1").await.unwrap().as_deref(),
            Some("t-1")
        );
        store.delete_job_task("job-1").await.unwrap();
        assert!(store.task_id_for_job("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_respects_limit() {
        let store = store();
        for index in 0..5 {
            let key = DedupeKey::new(index, "m", format!("fp{index}"));
            store.set(DedupeEntry::new(&key)).await.unwrap();
        }
        assert_eq!(store.list(3).await.unwrap().len(), 3);
    }

    #[test]
    fn test_status_vocabulary_round_trip() {
        assert_eq!(
            "create_start".parse::<DedupeStatus>().unwrap(),
            DedupeStatus::CreateStart
        );
        assert_eq!(DedupeStatus::TaskCreated.to_string(), "task_created");
    }

    #[test]
    fn test_orphan_candidates() {
        assert!(DedupeStatus::CreateStart.is_orphan_candidate());
        assert!(DedupeStatus::Waiting.is_orphan_candidate());
        assert!(!DedupeStatus::Failed.is_orphan_candidate());
        assert!(!DedupeStatus::Delivered.is_orphan_candidate());
    }

    #[test]
    fn test_resubmit_blocking() {
        assert!(DedupeStatus::Running.blocks_resubmit());
        assert!(DedupeStatus::Completed.blocks_resubmit());
        assert!(!DedupeStatus::Failed.blocks_resubmit());
        assert!(!DedupeStatus::Canceled.blocks_resubmit());
    }

    #[test]
    fn test_entry_age() {
        let mut entry = DedupeEntry::new(&key());
        assert!(entry.age_seconds(100.0).is_infinite());
        entry.updated_ts = 40.0;
        assert_eq!(entry.age_seconds(100.0), 60.0);
    }
}
