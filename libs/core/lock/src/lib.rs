//! Per-key serialization primitives.
//!
//! The orchestrator serializes critical sections by named keys (balance
//! updates, per-dedupe-key generation runs). `KeyedMutex` provides the
//! in-process variant; `LockManager` layers a Redis `SET NX EX` lock on top
//! and degrades to the in-process mutex when Redis is absent or unhealthy.

mod keyed;
mod manager;
mod redis_lock;

pub use keyed::KeyedMutex;
pub use manager::{LockGuard, LockManager, LockOptions};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out waiting for lock '{key}' after {waited_ms}ms")]
    Timeout { key: String, waited_ms: u64 },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type LockResult<T> = Result<T, LockError>;
