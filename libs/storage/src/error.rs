use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage read failed: {0}")]
    ReadFail(String),

    #[error("Storage write failed: {0}")]
    WriteFail(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

impl StorageError {
    /// Stable code used in logs and surfaced errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ReadFail(_) => "STORAGE_READ_FAIL",
            Self::WriteFail(_) => "STORAGE_WRITE_FAIL",
            Self::Serialization(_) => "STORAGE_READ_FAIL",
            Self::Database(_) => "DB_DEGRADED",
            Self::JobNotFound(_) => "STORAGE_READ_FAIL",
        }
    }

    /// Whether a reconciler should back off and retry rather than give up.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
