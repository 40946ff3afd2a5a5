//! Process-wide wiring.
//!
//! Everything that used to be module-level state (request tracker, dedupe
//! map, admin cache) lives here as fields; the runtime is constructed once
//! at startup and passed by reference.

use core_config::admin::AdminConfig;
use core_config::delivery::DeliveryConfig;
use core_config::kie::KieConfig;
use core_config::reconciler::ReconcilerConfig;
use core_config::redis::RedisConfig;
use core_config::storage::{StorageConfig, StorageMode};
use core_config::tenant::TenantId;
use core_config::{env_or_default, env_parse, Environment, FromEnv};
use distributed_lock::LockManager;
use domain_billing::{BillingGate, ChargeRequest, FreeTier};
use domain_catalog::ModelCatalog;
use domain_delivery::{
    ChargeCommitter, ChatTransport, DeliveryPipeline, DeliveryService, PendingReconciler,
};
use domain_generations::{
    GenerationCoordinator, GenerationError, HttpResultValidator, JobEngine, MemoryDedupeStore,
    OrphanReconciler, RedisDedupeStore, RequestTracker, SubmitOutcome, SubmitRequest,
};
use eyre::WrapErr;
use kie_client::ProviderClient;
use observability::dedupe::OrphanMetrics;
use observability::delivery::DeliveryMetrics;
use redis::aio::ConnectionManager;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use storage::{JobRecord, JsonStorage, PgStorage, StorageHandle};
use tracing::{info, warn};

use crate::transport::TransportOrphanNotifier;
use async_trait::async_trait;

/// All environment-driven settings in one place.
pub struct RuntimeConfig {
    pub environment: Environment,
    pub tenant: TenantId,
    pub kie: KieConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub reconciler: ReconcilerConfig,
    pub admins: AdminConfig,
    pub catalog_path: String,
    /// Overall per-job wall-clock bound
    pub job_timeout: Duration,
    pub dedupe_ttl: Duration,
    pub free_base_per_hour: u32,
    pub health_port: u16,
}

impl RuntimeConfig {
    pub fn from_env() -> eyre::Result<Self> {
        Ok(Self {
            environment: Environment::from_env(),
            tenant: TenantId::from_env(),
            kie: KieConfig::from_env().wrap_err("Failed to load KIE configuration")?,
            redis: RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?,
            storage: StorageConfig::from_env().wrap_err("Failed to load storage configuration")?,
            delivery: DeliveryConfig::from_env().wrap_err("Failed to load delivery configuration")?,
            reconciler: ReconcilerConfig::from_env()
                .wrap_err("Failed to load reconciler configuration")?,
            admins: AdminConfig::from_env().wrap_err("Failed to load admin configuration")?,
            catalog_path: env_or_default("MODEL_CATALOG_PATH", "models_catalog.json"),
            job_timeout: Duration::from_secs(env_parse("GEN_TIMEOUT_SECONDS", 900u64)?),
            dedupe_ttl: Duration::from_secs(env_parse("GEN_DEDUPE_TTL_SECONDS", 3600u64)?),
            free_base_per_hour: env_parse("FREE_TOOLS_BASE_PER_HOUR", 5u32)?,
            health_port: env_parse("HEALTH_PORT", 8080u16)?,
        })
    }
}

/// Stub-mode validator: fabricated result URLs are not fetchable, so the
/// content probe is skipped entirely.
struct PassValidator;

#[async_trait]
impl domain_generations::ResultValidator for PassValidator {
    async fn validate(
        &self,
        _urls: &[String],
        _media_type: Option<domain_catalog::MediaKind>,
        _correlation_id: &str,
    ) -> Result<(), GenerationError> {
        Ok(())
    }
}

/// Adapts the billing gate to the delivery layer's charge seam.
struct GateCharger {
    gate: Arc<BillingGate>,
}

#[async_trait]
impl ChargeCommitter for GateCharger {
    async fn commit_post_delivery_charge(&self, job: &JobRecord) -> Result<(), String> {
        let Some(task_id) = job.provider_task_id.clone() else {
            return Err("job has no provider task id".to_string());
        };
        let request = ChargeRequest {
            user_id: job.user_id,
            task_id,
            sku_id: job.sku_id.clone(),
            price: job.price,
            is_free: job.free,
        };
        self.gate
            .commit_post_delivery_charge(&request)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Fully wired orchestrator.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub redis: Option<ConnectionManager>,
    pub catalog: Arc<ModelCatalog>,
    pub client: Arc<dyn ProviderClient>,
    pub storage: StorageHandle,
    pub locks: LockManager,
    pub tracker: Arc<RequestTracker>,
    pub coordinator: Arc<GenerationCoordinator>,
    pub billing: Arc<BillingGate>,
    pub delivery: Arc<DeliveryService>,
    pub pending_reconciler: Arc<PendingReconciler>,
    pub orphan_reconciler: Arc<OrphanReconciler>,
}

impl Runtime {
    pub async fn build(
        config: RuntimeConfig,
        transport: Arc<dyn ChatTransport>,
    ) -> eyre::Result<Self> {
        // Redis is optional; every consumer degrades without it.
        let redis = match &config.redis.url {
            Some(url) => match database::redis::connect(url, config.redis.connect_timeout).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, degrading to in-process mode");
                    None
                }
            },
            None => None,
        };

        let storage: StorageHandle = match config.storage.mode {
            StorageMode::Json => {
                info!(dir = %config.storage.data_dir.display(), tenant = %config.tenant, "Using JSON storage backend");
                Arc::new(JsonStorage::new(
                    &config.storage.data_dir,
                    config.tenant.as_str(),
                )?)
            }
            StorageMode::Db => {
                let url = config
                    .storage
                    .database_url
                    .as_deref()
                    .ok_or_else(|| eyre::eyre!("DATABASE_URL is required for db storage mode"))?;
                let db = database::postgres::connect_with_retry(url, None)
                    .await
                    .wrap_err("Failed to connect to PostgreSQL")?;
                let pg = PgStorage::new(db, config.tenant.as_str());
                pg.ensure_schema().await?;
                info!(tenant = %config.tenant, "Using PostgreSQL storage backend");
                Arc::new(pg)
            }
        };

        let catalog = match ModelCatalog::from_file(&config.catalog_path) {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => {
                warn!(path = %config.catalog_path, error = %e, "Model catalog unavailable, starting empty");
                Arc::new(ModelCatalog::new(Vec::new()))
            }
        };

        let client = kie_client::client_from_config(&config.kie)
            .wrap_err("Failed to build provider client")?;

        let locks = LockManager::new(config.tenant.clone(), redis.clone());
        let dedupe: Arc<dyn domain_generations::DedupeStore> = match &redis {
            Some(conn) => Arc::new(RedisDedupeStore::new(
                conn.clone(),
                config.tenant.clone(),
                config.dedupe_ttl,
            )),
            None => Arc::new(MemoryDedupeStore::new(
                config.tenant.clone(),
                config.dedupe_ttl,
            )),
        };
        let tracker = Arc::new(RequestTracker::default());

        let validator: Arc<dyn domain_generations::ResultValidator> = if config.kie.is_live() {
            Arc::new(HttpResultValidator::new(Duration::from_secs(12))?)
        } else {
            Arc::new(PassValidator)
        };
        let engine = Arc::new(JobEngine::new(
            client.clone(),
            Arc::clone(&storage),
            Arc::clone(&catalog),
            dedupe.clone(),
            validator.clone(),
            domain_generations::EngineConfig {
                timeout: config.job_timeout,
                poll_interval: Duration::from_secs(3),
                poll_max_attempts: config.kie.poll_max_attempts,
                poll_max_delay: Duration::from_secs(12),
                waiting_timeout: None,
                result_cdn_base_url: config.kie.result_cdn_base_url.clone(),
                provider_base_url: Some(config.kie.api_url.clone()),
            },
        ));
        let coordinator = Arc::new(GenerationCoordinator::new(
            engine,
            dedupe.clone(),
            tracker.clone(),
            locks.clone(),
            Arc::clone(&catalog),
        ));

        let billing = Arc::new(BillingGate::new(
            Arc::clone(&storage),
            locks.clone(),
            config.admins.clone(),
            FreeTier::new(Arc::clone(&storage), config.free_base_per_hour),
            catalog.free_sku_allowlist(),
        ));

        let pipeline = Arc::new(DeliveryPipeline::new(
            transport.clone(),
            client.clone(),
            config.delivery.clone(),
        )?);
        let delivery = Arc::new(DeliveryService::new(
            pipeline,
            Arc::clone(&storage),
            Arc::new(DeliveryMetrics::new()),
            Some(Arc::new(GateCharger {
                gate: billing.clone(),
            })),
        ));

        let pending_reconciler = Arc::new(PendingReconciler::new(
            Arc::clone(&storage),
            client.clone(),
            Arc::clone(&catalog),
            validator,
            delivery.clone(),
            config.reconciler.clone(),
            config.kie.result_cdn_base_url.clone(),
        ));
        let orphan_reconciler = Arc::new(OrphanReconciler::new(
            dedupe,
            client.clone(),
            Some(Arc::new(TransportOrphanNotifier::new(transport))),
            Arc::new(OrphanMetrics::new()),
            config.reconciler.clone(),
        ));

        Ok(Self {
            config,
            redis,
            catalog,
            client,
            storage,
            locks,
            tracker,
            coordinator,
            billing,
            delivery,
            pending_reconciler,
            orphan_reconciler,
        })
    }

    /// End-to-end user flow: affordability, submit (deduplicated), deliver,
    /// charge. Insufficient funds surface before anything is submitted.
    pub async fn handle_generation(
        &self,
        user_id: i64,
        model_id: &str,
        params: Value,
        sku_id: Option<&str>,
    ) -> Result<SubmitOutcome, GenerationError> {
        if let Some(sku_id) = sku_id {
            let spec = self
                .catalog
                .get(model_id)
                .ok_or_else(|| GenerationError::ModelNotFound(model_id.to_string()))?;
            let price = spec.price_for_sku(sku_id).unwrap_or(Decimal::ZERO);
            let free_covers = spec.free && self.catalog.free_sku_allowlist().contains(sku_id);
            if !free_covers {
                if let Err(e) = self.billing.check_affordable(user_id, price).await {
                    return Err(GenerationError::Validation {
                        code: "INSUFFICIENT_FUNDS",
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut submit = SubmitRequest::new(user_id, model_id, params);
        submit.sku_id = sku_id.map(str::to_string);
        let outcome = self.coordinator.submit(submit).await?;

        if let SubmitOutcome::Completed { job_id, result } = &outcome {
            match self.storage.get_job(job_id).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.delivery.deliver_job(&job, result, None).await {
                        warn!(job_id = %job_id, error = %e, "delivery failed after generation");
                    }
                }
                Ok(None) => warn!(job_id = %job_id, "completed job missing from storage"),
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to load job for delivery"),
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoggingTransport;
    use serde_json::json;
    use std::str::FromStr;
    use storage::JobStatus;

    fn test_config(dir: &std::path::Path) -> RuntimeConfig {
        let catalog_path = dir.join("catalog.json");
        std::fs::write(
            &catalog_path,
            json!([
                {
                    "id": "flux-2/pro-text-to-image",
                    "output_media_type": "image",
                    "schema_required": ["prompt"],
                    "schema_properties": {"prompt": {"type": "string"}},
                    "modes": [{"sku_id": "flux:base", "unit": "image", "price_rub": "12.34"}],
                },
            ])
            .to_string(),
        )
        .unwrap();

        RuntimeConfig {
            environment: Environment::Development,
            tenant: TenantId::new("test"),
            kie: KieConfig {
                stub: true,
                ..KieConfig::default()
            },
            redis: RedisConfig {
                url: None,
                connect_timeout: Duration::from_millis(100),
            },
            storage: StorageConfig {
                mode: StorageMode::Json,
                data_dir: dir.join("data"),
                database_url: None,
            },
            delivery: DeliveryConfig::default(),
            reconciler: ReconcilerConfig::default(),
            admins: AdminConfig::default(),
            catalog_path: catalog_path.to_string_lossy().to_string(),
            job_timeout: Duration::from_secs(60),
            dedupe_ttl: Duration::from_secs(3600),
            free_base_per_hour: 5,
            health_port: 0,
        }
    }

    // The stub fabricates result URLs that are not fetchable, so end-to-end
    // runs in tests stop at the delivery fetch; everything up to and
    // including result resolution and job persistence is real.
    #[tokio::test]
    async fn test_stub_generation_reaches_completed_state() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::build(test_config(dir.path()), Arc::new(LoggingTransport))
            .await
            .unwrap();

        let outcome = runtime
            .coordinator
            .submit(domain_generations::SubmitRequest::new(
                7,
                "flux-2/pro-text-to-image",
                json!({"prompt": "cat"}),
            ))
            .await
            .unwrap();

        let SubmitOutcome::Completed { job_id, result } = outcome else {
            panic!("expected completed outcome");
        };
        assert_eq!(result.urls.len(), 1);

        let job = runtime.storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.provider_task_id.is_some());
    }

    #[tokio::test]
    async fn test_insufficient_funds_surface_before_submit() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::build(test_config(dir.path()), Arc::new(LoggingTransport))
            .await
            .unwrap();
        runtime
            .storage
            .set_user_balance(7, Decimal::from_str("1.00").unwrap())
            .await
            .unwrap();

        let err = runtime
            .handle_generation(7, "flux-2/pro-text-to-image", json!({"prompt": "cat"}), Some("flux:base"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn test_runtime_degrades_without_redis() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::build(test_config(dir.path()), Arc::new(LoggingTransport))
            .await
            .unwrap();
        assert!(runtime.redis.is_none());
        assert_eq!(runtime.locks.mode(), "in-process");
    }
}
