//! Storage façade.
//!
//! The only component aware of persistence format. Two backends implement
//! the same [`Storage`] trait: JSON files under `data/<tenant>/` for
//! development, PostgreSQL (document table + structured job table, per-row
//! tenant column) for production. All counters and balances are mutated
//! exclusively through atomic read-modify-write operations.

mod error;
mod facade;
mod json;
mod models;
mod postgres;

pub use error::{StorageError, StorageResult};
pub use facade::{JsonUpdater, Storage, StorageHandle};
pub use json::JsonStorage;
pub use models::{
    DeliveryState, HourlyFreeUsage, JobRecord, JobStatus, JobUpdate, PaymentRecord,
};
pub use postgres::PgStorage;
