//! Post-delivery billing gate.
//!
//! Called only after `delivered=true`. Idempotency comes from a per-process
//! `charged@<task_id>` marker backed by the persisted delivery record; the
//! balance decrement itself runs under the per-user balance lock.

use core_config::admin::AdminConfig;
use distributed_lock::{LockManager, LockOptions};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use storage::StorageHandle;
use tracing::{error, info};

use crate::error::{BillingError, BillingResult};
use crate::free::{FreeConsumption, FreeTier};

/// One charge to settle.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub user_id: i64,
    pub task_id: String,
    pub sku_id: Option<String>,
    /// Price in RUB; rounded HALF_UP to 2 decimal places before debiting
    pub price: Decimal,
    pub is_free: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// This task was already settled; nothing happened.
    AlreadyCharged,
    AdminBypass,
    Free(FreeConsumption),
    Charged { amount: Decimal },
    /// Zero price and not free-tier: nothing to debit.
    NothingToCharge,
}

pub struct BillingGate {
    storage: StorageHandle,
    locks: LockManager,
    admins: AdminConfig,
    free_tier: FreeTier,
    free_allowlist: HashSet<String>,
    charged: Mutex<HashSet<String>>,
}

impl BillingGate {
    pub fn new(
        storage: StorageHandle,
        locks: LockManager,
        admins: AdminConfig,
        free_tier: FreeTier,
        free_allowlist: HashSet<String>,
    ) -> Self {
        Self {
            storage,
            locks,
            admins,
            free_tier,
            free_allowlist,
            charged: Mutex::new(HashSet::new()),
        }
    }

    /// Pre-flight affordability check, surfaced to the user before the
    /// generation is submitted.
    pub async fn check_affordable(&self, user_id: i64, price: Decimal) -> BillingResult<()> {
        if self.admins.is_admin(user_id) || price <= Decimal::ZERO {
            return Ok(());
        }
        let balance = self.storage.get_user_balance(user_id).await?;
        let needed = round_rub(price);
        if balance < needed {
            return Err(BillingError::InsufficientFunds { needed, balance });
        }
        Ok(())
    }

    fn mark_charged(&self, task_id: &str) -> bool {
        self.charged
            .lock()
            .expect("charge marker set poisoned")
            .insert(format!("charged@{task_id}"))
    }

    /// Settle the charge for one delivered task, exactly once.
    pub async fn commit_post_delivery_charge(
        &self,
        request: &ChargeRequest,
    ) -> BillingResult<ChargeOutcome> {
        if !self.mark_charged(&request.task_id) {
            info!(
                task_id = %request.task_id,
                user_id = request.user_id,
                "charge already committed for task, skipping"
            );
            return Ok(ChargeOutcome::AlreadyCharged);
        }

        if self.admins.is_admin(request.user_id) {
            info!(
                task_id = %request.task_id,
                user_id = request.user_id,
                "admin bypass, no charge"
            );
            return Ok(ChargeOutcome::AdminBypass);
        }

        let free_eligible = request.is_free
            && request
                .sku_id
                .as_deref()
                .is_some_and(|sku_id| self.free_allowlist.contains(sku_id));
        if free_eligible {
            let source = self.free_tier.consume(request.user_id).await?;
            return Ok(ChargeOutcome::Free(source));
        }

        let amount = round_rub(request.price);
        if amount <= Decimal::ZERO {
            return Ok(ChargeOutcome::NothingToCharge);
        }

        let guard = self
            .locks
            .acquire(
                &format!("balance:{}", request.user_id),
                LockOptions::default()
                    .with_ttl(Duration::from_secs(15))
                    .with_wait(Duration::from_secs(12)),
            )
            .await?;
        let charged = self
            .storage
            .subtract_user_balance(request.user_id, amount)
            .await;
        guard.release().await;

        match charged {
            Ok(true) => {
                info!(
                    task_id = %request.task_id,
                    user_id = request.user_id,
                    amount = %amount,
                    "balance charged"
                );
                Ok(ChargeOutcome::Charged { amount })
            }
            Ok(false) => {
                let balance = self.storage.get_user_balance(request.user_id).await?;
                // This must have been caught before delivery; reaching it
                // here is a contract violation.
                error!(
                    task_id = %request.task_id,
                    user_id = request.user_id,
                    needed = %amount,
                    balance = %balance,
                    error_code = "BILLING_INVARIANT",
                    "insufficient funds after delivery"
                );
                Err(BillingError::InsufficientFunds {
                    needed: amount,
                    balance,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// RUB prices round HALF_UP to 2 decimal places.
fn round_rub(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
