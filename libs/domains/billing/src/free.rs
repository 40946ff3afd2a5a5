//! Hourly free tier plus the referral bonus bank.
//!
//! The hourly window holds `base_per_hour` tokens and slides on read; when
//! the window is exhausted, consumption falls through to the referral bank.

use chrono::{Duration as ChronoDuration, Utc};
use storage::StorageHandle;
use tracing::info;

use crate::error::{BillingError, BillingResult};

/// Where one free generation was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeConsumption {
    Hourly,
    Referral,
}

#[derive(Debug, Clone)]
pub struct FreeStatus {
    pub base_remaining: u32,
    pub referral_remaining: i64,
}

impl FreeStatus {
    pub fn total_remaining(&self) -> i64 {
        i64::from(self.base_remaining) + self.referral_remaining.max(0)
    }
}

pub struct FreeTier {
    storage: StorageHandle,
    base_per_hour: u32,
}

impl FreeTier {
    pub fn new(storage: StorageHandle, base_per_hour: u32) -> Self {
        Self {
            storage,
            base_per_hour,
        }
    }

    /// Non-consuming snapshot of the user's free budget.
    pub async fn status(&self, user_id: i64) -> BillingResult<FreeStatus> {
        let usage = self.storage.get_hourly_free_usage(user_id).await?;
        let referral_remaining = self.storage.get_referral_free_bank(user_id).await?;
        Ok(FreeStatus {
            base_remaining: self.base_per_hour.saturating_sub(usage.used_count),
            referral_remaining: referral_remaining.max(0),
        })
    }

    /// Consume one free slot: hourly window first, then the referral bank.
    pub async fn consume(&self, user_id: i64) -> BillingResult<FreeConsumption> {
        let usage = self.storage.get_hourly_free_usage(user_id).await?;
        let window_start = usage.window_start.unwrap_or_else(Utc::now);
        let used_count = usage.used_count;

        if used_count < self.base_per_hour {
            self.storage
                .set_hourly_free_usage(user_id, window_start, used_count + 1)
                .await?;
            info!(
                user_id,
                used = used_count + 1,
                limit = self.base_per_hour,
                source = "hourly",
                "free generation consumed"
            );
            return Ok(FreeConsumption::Hourly);
        }

        let referral_remaining = self.storage.get_referral_free_bank(user_id).await?;
        if referral_remaining > 0 {
            self.storage
                .set_referral_free_bank(user_id, referral_remaining - 1)
                .await?;
            info!(
                user_id,
                remaining = referral_remaining - 1,
                source = "referral",
                "free generation consumed"
            );
            return Ok(FreeConsumption::Referral);
        }

        let reset_at = window_start + ChronoDuration::hours(1);
        let reset_in_minutes = ((reset_at - Utc::now()).num_seconds().max(60)) / 60;
        Err(BillingError::FreeTierExhausted { reset_in_minutes })
    }

    /// Credit referral bonus generations.
    pub async fn add_referral_bonus(&self, user_id: i64, bonus: i64) -> BillingResult<i64> {
        let current = self.storage.get_referral_free_bank(user_id).await?;
        let new_total = current + bonus.max(0);
        self.storage
            .set_referral_free_bank(user_id, new_total)
            .await?;
        Ok(new_total)
    }
}
