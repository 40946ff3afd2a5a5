//! Short-window in-process idempotency cache.
//!
//! Collapses rapid duplicate clicks that arrive faster than the dedupe
//! store propagates. Optimization only; the dedupe store plus lock is the
//! correctness layer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::dedupe::DedupeKey;

#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub job_id: String,
    pub task_id: Option<String>,
    created_at: Instant,
}

/// Per-process map `(user, model, fingerprint) -> recent submission`.
pub struct RequestTracker {
    ttl: Duration,
    entries: Mutex<HashMap<DedupeKey, TrackedRequest>>,
}

impl RequestTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &DedupeKey) -> Option<TrackedRequest> {
        let mut entries = self.entries.lock().expect("tracker map poisoned");
        let expired = matches!(
            entries.get(key),
            Some(entry) if entry.created_at.elapsed() > self.ttl
        );
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).cloned()
    }

    pub fn set(&self, key: DedupeKey, job_id: impl Into<String>) -> TrackedRequest {
        let entry = TrackedRequest {
            job_id: job_id.into(),
            task_id: None,
            created_at: Instant::now(),
        };
        self.entries
            .lock()
            .expect("tracker map poisoned")
            .insert(key, entry.clone());
        entry
    }

    pub fn update_task_id(&self, key: &DedupeKey, task_id: Option<&str>) {
        let mut entries = self.entries.lock().expect("tracker map poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.task_id = task_id.map(str::to_string);
        }
    }

    pub fn remove(&self, key: &DedupeKey) {
        self.entries
            .lock()
            .expect("tracker map poisoned")
            .remove(key);
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DedupeKey {
        DedupeKey::new(1, "model", "fp")
    }

    #[tokio::test]
    async fn test_set_get() {
        let tracker = RequestTracker::default();
        tracker.set(key(), "job-1");
        let entry = tracker.get(&key()).unwrap();
        assert_eq!(entry.job_id, "job-1");
        assert!(entry.task_id.is_none());
    }

    #[tokio::test]
    async fn test_task_id_update() {
        let tracker = RequestTracker::default();
        tracker.set(key(), "job-1");
        tracker.update_task_id(&key(), Some("t-1"));
        assert_eq!(tracker.get(&key()).unwrap().task_id.as_deref(), Some("t-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let tracker = RequestTracker::new(Duration::from_secs(15));
        tracker.set(key(), "job-1");
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(tracker.get(&key()).is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let tracker = RequestTracker::default();
        tracker.set(key(), "job-1");
        tracker.remove(&key());
        assert!(tracker.get(&key()).is_none());
    }
}
