use std::time::Duration;

use core_config::tenant::TenantId;
use redis::aio::ConnectionManager;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::keyed::KeyedMutex;
use crate::redis_lock;
use crate::{LockError, LockResult};

/// Acquisition parameters for a named lock.
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// TTL after which Redis reclaims the lock from a crashed holder
    pub ttl: Duration,
    /// Maximum time to wait for acquisition
    pub wait: Duration,
    /// Interval between acquisition attempts
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            wait: Duration::from_secs(2),
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl LockOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

enum GuardInner {
    Redis {
        conn: ConnectionManager,
        key: String,
        value: String,
        released: bool,
    },
    Local(#[allow(dead_code)] OwnedMutexGuard<()>),
}

/// Scoped lock handle. Dropping it releases the lock; for the Redis variant
/// the release is spawned best-effort, and the TTL covers the crash case.
pub struct LockGuard {
    inner: GuardInner,
}

impl LockGuard {
    /// Release explicitly; preferred on normal exit paths.
    pub async fn release(mut self) {
        if let GuardInner::Redis {
            conn,
            key,
            value,
            released,
        } = &mut self.inner
        {
            if !*released {
                *released = true;
                redis_lock::release(conn, key, value).await;
            }
        }
    }

    /// Whether this guard holds the distributed (Redis) lock rather than the
    /// in-process fallback.
    pub fn is_distributed(&self) -> bool {
        matches!(self.inner, GuardInner::Redis { .. })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let GuardInner::Redis {
            conn,
            key,
            value,
            released,
        } = &mut self.inner
        {
            if !*released {
                *released = true;
                let conn = conn.clone();
                let key = std::mem::take(key);
                let value = std::mem::take(value);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        redis_lock::release(&conn, &key, &value).await;
                    });
                }
            }
        }
    }
}

/// Named-lock manager, tenant-scoped, with safe degradation.
///
/// With Redis configured, locks are `SET NX EX` keys released by an
/// owner-checked script. Without Redis (or when Redis errors mid-acquire)
/// the manager serializes through a process-local `KeyedMutex`, emitting a
/// fallback metric each time.
#[derive(Clone)]
pub struct LockManager {
    tenant: TenantId,
    redis: Option<ConnectionManager>,
    keyed: KeyedMutex,
}

impl LockManager {
    pub fn new(tenant: TenantId, redis: Option<ConnectionManager>) -> Self {
        if redis.is_none() {
            tracing::info!("LockManager mode=in-process reason=redis_unconfigured");
        } else {
            tracing::info!("LockManager mode=redis");
        }
        Self {
            tenant,
            redis,
            keyed: KeyedMutex::new(),
        }
    }

    /// Current lock mode, for diagnostics.
    pub fn mode(&self) -> &'static str {
        if self.redis.is_some() {
            "redis"
        } else {
            "in-process"
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("lock:{}", self.tenant.scoped_key(key))
    }

    /// Acquire the lock for `key`, waiting up to `opts.wait`.
    pub async fn acquire(&self, key: &str, opts: LockOptions) -> LockResult<LockGuard> {
        let full_key = self.full_key(key);
        let started = Instant::now();

        match &self.redis {
            Some(conn) => {
                let value = redis_lock::owner_token();
                loop {
                    match redis_lock::try_acquire(conn, &full_key, &value, opts.ttl.as_secs().max(1))
                        .await
                    {
                        Ok(true) => {
                            debug!(key = %key, ttl_s = %opts.ttl.as_secs(), "LOCK_ACQUIRED");
                            return Ok(LockGuard {
                                inner: GuardInner::Redis {
                                    conn: conn.clone(),
                                    key: full_key,
                                    value,
                                    released: false,
                                },
                            });
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(key = %key, error = %e, "LOCK_ACQUIRE_ERROR, degrading to in-process mutex");
                            observability::record_lock_fallback("redis_error");
                            let remaining = opts.wait.saturating_sub(started.elapsed());
                            return self.acquire_local(key, &full_key, remaining, started).await;
                        }
                    }

                    if started.elapsed() >= opts.wait {
                        warn!(key = %key, wait_ms = %started.elapsed().as_millis(), "LOCK_TIMEOUT");
                        return Err(LockError::Timeout {
                            key: key.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(opts.retry_interval).await;
                }
            }
            None => {
                observability::record_lock_fallback("redis_unconfigured");
                self.acquire_local(key, &full_key, opts.wait, started).await
            }
        }
    }

    async fn acquire_local(
        &self,
        key: &str,
        full_key: &str,
        wait: Duration,
        started: Instant,
    ) -> LockResult<LockGuard> {
        match tokio::time::timeout(wait, self.keyed.acquire(full_key)).await {
            Ok(guard) => {
                debug!(key = %key, "LOCK_ACQUIRED (in-process)");
                Ok(LockGuard {
                    inner: GuardInner::Local(guard),
                })
            }
            Err(_) => {
                warn!(key = %key, wait_ms = %started.elapsed().as_millis(), "LOCK_TIMEOUT (in-process)");
                Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }
}
