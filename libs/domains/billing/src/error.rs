use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Insufficient funds: need {needed}, balance {balance}")]
    InsufficientFunds { needed: Decimal, balance: Decimal },

    #[error("Free tier exhausted; resets in {reset_in_minutes} minutes")]
    FreeTierExhausted { reset_in_minutes: i64 },

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error(transparent)]
    Lock(#[from] distributed_lock::LockError),
}

impl BillingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::FreeTierExhausted { .. } => "FREE_TIER_EXHAUSTED",
            Self::Storage(e) => e.code(),
            Self::Lock(_) => "INTERNAL_EXCEPTION",
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
