use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Process-local mutex map keyed by string.
///
/// Guards are owned, so they can be held across await points and stored in
/// composite lock guards. Entries persist for the lifetime of the map; the
/// key space is bounded (users x models in flight), so no eviction is done.
#[derive(Clone, Default)]
pub struct KeyedMutex {
    entries: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock().expect("keyed mutex map poisoned");
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the mutex for `key`, waiting as long as it takes.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Try to acquire the mutex for `key` without waiting.
    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let mutex = KeyedMutex::new();
        let counter = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mutex = mutex.clone();
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = mutex.acquire("balance:1").await;
                let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(inside, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let mutex = KeyedMutex::new();
        let _guard_a = mutex.acquire("a").await;
        // A second key is immediately available while "a" is held.
        assert!(mutex.try_acquire("b").is_some());
        // The held key is not.
        assert!(mutex.try_acquire("a").is_none());
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let mutex = KeyedMutex::new();
        {
            let _guard = mutex.acquire("a").await;
        }
        assert!(mutex.try_acquire("a").is_some());
    }
}
