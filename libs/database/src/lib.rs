//! Database connectors for the orchestrator.
//!
//! Thin wrappers around `redis` and `sea-orm` that add retry-on-connect and
//! the sub-second Redis connect deadline the lock manager relies on for fast
//! degradation.

pub mod common;
pub mod postgres;
pub mod redis;

pub use common::{retry, retry_with_backoff, RetryConfig};
