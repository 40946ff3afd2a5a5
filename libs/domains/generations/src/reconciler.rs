//! Orphan recovery: dedupe entries that never received a provider task id.
//!
//! Runs forever on a fixed interval. Recovery goes through the local
//! `job_id -> task_id` index first, then the provider's resolver when the
//! client exposes one. Entries stuck past the age limit are failed and the
//! affected user is notified (rate-limited) with a retry option.

use kie_client::ProviderClient;
use observability::dedupe::OrphanMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use async_trait::async_trait;
use core_config::reconciler::ReconcilerConfig;

use crate::dedupe::{epoch_seconds, DedupeEntry, DedupeStatus, DedupeStore};

/// Transport-side notification seam; implemented by the chat layer.
#[async_trait]
pub trait OrphanNotifier: Send + Sync {
    /// Tell the user their generation stalled and offer a retry.
    async fn notify_orphan(&self, user_id: i64, model_id: &str) -> Result<(), String>;
}

pub struct OrphanReconciler {
    dedupe: Arc<dyn DedupeStore>,
    client: Arc<dyn ProviderClient>,
    notifier: Option<Arc<dyn OrphanNotifier>>,
    metrics: Arc<OrphanMetrics>,
    config: ReconcilerConfig,
}

impl OrphanReconciler {
    pub fn new(
        dedupe: Arc<dyn DedupeStore>,
        client: Arc<dyn ProviderClient>,
        notifier: Option<Arc<dyn OrphanNotifier>>,
        metrics: Arc<OrphanMetrics>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            dedupe,
            client,
            notifier,
            metrics,
            config,
        }
    }

    /// Perpetual loop; storage failures back off exponentially (capped) and
    /// never abort the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.interval;
        let mut degraded_backoff = Duration::ZERO;
        info!(
            interval_s = self.config.interval.as_secs(),
            batch_limit = self.config.batch_limit,
            orphan_max_age_s = self.config.orphan_max_age.as_secs(),
            "orphan reconciler started"
        );
        loop {
            if *shutdown.borrow() {
                info!("orphan reconciler stopping");
                return;
            }
            match self.reconcile_once().await {
                Ok(()) => {
                    backoff = self.config.interval;
                    degraded_backoff = Duration::ZERO;
                }
                Err(e) => {
                    degraded_backoff = if degraded_backoff.is_zero() {
                        Duration::from_secs(5)
                    } else {
                        (degraded_backoff * 2).min(Duration::from_secs(60))
                    };
                    backoff = self.config.interval.max(degraded_backoff);
                    warn!(
                        error = %e,
                        delay_s = backoff.as_secs(),
                        error_code = "DB_DEGRADED",
                        "orphan reconciler degraded, backing off"
                    );
                }
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One sweep over the dedupe store.
    pub async fn reconcile_once(&self) -> Result<(), crate::dedupe::DedupeError> {
        let entries = self.dedupe.list(self.config.batch_limit).await?;
        let now_ts = epoch_seconds();
        let orphans: Vec<DedupeEntry> = entries
            .into_iter()
            .filter(|entry| entry.task_id.is_none() && entry.status.is_orphan_candidate())
            .collect();
        self.metrics
            .record_orphan_count(orphans.len(), self.config.orphan_alert_threshold);
        if orphans.is_empty() {
            return Ok(());
        }

        for entry in orphans {
            let key = entry.key();
            let age_seconds = entry.age_seconds(now_ts);
            let attempts = entry.recovery_attempts + 1;

            if let Some(task_id) = self.recover_task_id(&entry).await {
                self.dedupe
                    .update(
                        &key,
                        Box::new(move |entry| {
                            entry.task_id = Some(task_id);
                            entry.status = DedupeStatus::Running;
                            entry.last_recovery_ts = now_ts;
                            entry.recovery_attempts = attempts;
                        }),
                    )
                    .await?;
                info!(
                    action = "DEDUPE_RECONCILE",
                    user_id = entry.user_id,
                    model_id = %entry.model_id,
                    job_id = entry.job_id.as_deref().unwrap_or("-"),
                    age_s = age_seconds as u64,
                    outcome = "recovered",
                    "orphan entry recovered"
                );
                continue;
            }

            if age_seconds < self.config.orphan_max_age.as_secs_f64() {
                continue;
            }

            self.dedupe
                .update(
                    &key,
                    Box::new(move |entry| {
                        entry.status = DedupeStatus::Failed;
                        entry.last_recovery_ts = now_ts;
                        entry.recovery_attempts = attempts;
                        entry.result_text = Some("dedupe_orphan_failed".to_string());
                    }),
                )
                .await?;
            info!(
                action = "DEDUPE_RECONCILE",
                user_id = entry.user_id,
                model_id = %entry.model_id,
                job_id = entry.job_id.as_deref().unwrap_or("-"),
                age_s = age_seconds as u64,
                outcome = "failed_orphan",
                "orphan entry marked failed"
            );

            if !self.should_notify(&entry, now_ts) {
                continue;
            }
            let Some(notifier) = &self.notifier else {
                continue;
            };
            match notifier.notify_orphan(entry.user_id, &entry.model_id).await {
                Ok(()) => {
                    self.dedupe
                        .update(
                            &key,
                            Box::new(move |entry| entry.orphan_notified_ts = now_ts),
                        )
                        .await?;
                }
                Err(e) => {
                    error!(
                        user_id = entry.user_id,
                        job_id = entry.job_id.as_deref().unwrap_or("-"),
                        error = %e,
                        "orphan notification failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn recover_task_id(&self, entry: &DedupeEntry) -> Option<String> {
        let job_id = entry.job_id.as_deref()?;
        match self.dedupe.task_id_for_job(job_id).await {
            Ok(Some(task_id)) => return Some(task_id),
            Ok(None) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "job/task index lookup failed");
            }
        }
        match self.client.resolve_task_id(job_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "provider task resolver failed");
                None
            }
        }
    }

    fn should_notify(&self, entry: &DedupeEntry, now_ts: f64) -> bool {
        if entry.orphan_notified_ts <= 0.0 {
            return true;
        }
        now_ts - entry.orphan_notified_ts >= self.config.notify_cooldown.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::{DedupeKey, MemoryDedupeStore};
    use core_config::tenant::TenantId;
    use kie_client::KieStub;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct RecordingNotifier {
        calls: AtomicU32,
        last: Mutex<Option<(i64, String)>>,
    }

    #[async_trait]
    impl OrphanNotifier for RecordingNotifier {
        async fn notify_orphan(&self, user_id: i64, model_id: &str) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some((user_id, model_id.to_string()));
            Ok(())
        }
    }

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            orphan_max_age: Duration::from_secs(0),
            ..ReconcilerConfig::default()
        }
    }

    struct Fixture {
        dedupe: Arc<MemoryDedupeStore>,
        notifier: Arc<RecordingNotifier>,
        reconciler: OrphanReconciler,
    }

    fn fixture(config: ReconcilerConfig) -> Fixture {
        let dedupe = Arc::new(MemoryDedupeStore::new(
            TenantId::new("test"),
            Duration::from_secs(3600),
        ));
        let notifier = Arc::new(RecordingNotifier {
            calls: AtomicU32::new(0),
            last: Mutex::new(None),
        });
        let reconciler = OrphanReconciler::new(
            dedupe.clone(),
            Arc::new(KieStub::new()),
            Some(notifier.clone()),
            Arc::new(OrphanMetrics::new()),
            config,
        );
        Fixture {
            dedupe,
            notifier,
            reconciler,
        }
    }

    async fn seed_orphan(dedupe: &MemoryDedupeStore, user_id: i64) -> DedupeKey {
        let key = DedupeKey::new(user_id, "flux/text-to-image", format!("fp-{user_id}"));
        dedupe
            .update(
                &key,
                Box::new(|entry| {
                    entry.status = DedupeStatus::CreateStart;
                    entry.job_id = Some("job-orphan".to_string());
                }),
            )
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn test_unrecoverable_orphan_fails_and_notifies_once() {
        let fixture = fixture(config());
        let key = seed_orphan(&fixture.dedupe, 7).await;

        fixture.reconciler.reconcile_once().await.unwrap();
        let entry = fixture.dedupe.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DedupeStatus::Failed);
        assert_eq!(entry.recovery_attempts, 1);
        assert!(entry.orphan_notified_ts > 0.0);
        assert_eq!(fixture.notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fixture.notifier.last.lock().unwrap().as_ref().unwrap().0,
            7
        );

        // Further sweeps inside the cooldown stay silent: the entry is now
        // failed and no longer an orphan candidate.
        fixture.reconciler.reconcile_once().await.unwrap();
        assert_eq!(fixture.notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_via_job_task_index() {
        let fixture = fixture(config());
        let key = seed_orphan(&fixture.dedupe, 8).await;
        fixture
            .dedupe
            .set_job_task("job-orphan", Some("t-recovered"))
            .await
            .unwrap();

        fixture.reconciler.reconcile_once().await.unwrap();
        let entry = fixture.dedupe.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DedupeStatus::Running);
        assert_eq!(entry.task_id.as_deref(), Some("t-recovered"));
        assert_eq!(fixture.notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_young_orphan_left_alone() {
        let fixture = fixture(ReconcilerConfig {
            orphan_max_age: Duration::from_secs(3600),
            ..ReconcilerConfig::default()
        });
        let key = seed_orphan(&fixture.dedupe, 9).await;

        fixture.reconciler.reconcile_once().await.unwrap();
        let entry = fixture.dedupe.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DedupeStatus::CreateStart);
        assert_eq!(fixture.notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_entries_with_task_id_are_not_orphans() {
        let fixture = fixture(config());
        let key = DedupeKey::new(10, "m", "fp");
        fixture
            .dedupe
            .update(
                &key,
                Box::new(|entry| {
                    entry.status = DedupeStatus::Running;
                    entry.task_id = Some("t-1".to_string());
                }),
            )
            .await
            .unwrap();

        fixture.reconciler.reconcile_once().await.unwrap();
        let entry = fixture.dedupe.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DedupeStatus::Running);
    }
}
