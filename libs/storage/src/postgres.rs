//! PostgreSQL backend: a `storage_json` document table for the JSON-shaped
//! concerns plus structured tables for jobs and payments. Every row carries
//! the tenant in `partner_id`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use serde_json::{json, Value};
use std::str::FromStr;

use crate::error::{StorageError, StorageResult};
use crate::facade::{JsonUpdater, Storage};
use crate::models::{HourlyFreeUsage, JobRecord, JobStatus, JobUpdate, PaymentRecord};

const USERS_DOC: &str = "users.json";
const HOURLY_DOC: &str = "hourly_free_usage.json";

mod storage_json {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "storage_json")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub partner_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub filename: String,
        pub payload: Json,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

mod jobs {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "generation_jobs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub job_id: String,
        pub partner_id: String,
        pub request_id: Option<String>,
        pub user_id: i64,
        pub model_id: String,
        pub prompt_fingerprint: Option<String>,
        pub params: Json,
        pub provider_task_id: Option<String>,
        pub status: String,
        pub result_urls: Json,
        #[sea_orm(column_type = "Text", nullable)]
        pub result_text: Option<String>,
        pub error_code: Option<String>,
        pub error_message: Option<String>,
        pub price: String,
        pub sku_id: Option<String>,
        pub free: bool,
        #[sea_orm(column_type = "Text", nullable)]
        pub prompt: Option<String>,
        pub created_at: DateTimeWithTimeZone,
        pub updated_at: DateTimeWithTimeZone,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

mod payments {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "payments")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub screenshot_id: String,
        pub partner_id: String,
        pub user_id: i64,
        pub amount: String,
        pub created_at: DateTimeWithTimeZone,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

fn job_to_model(job: &JobRecord, tenant: &str) -> jobs::ActiveModel {
    jobs::ActiveModel {
        job_id: Set(job.job_id.clone()),
        partner_id: Set(tenant.to_string()),
        request_id: Set(job.request_id.clone()),
        user_id: Set(job.user_id),
        model_id: Set(job.model_id.clone()),
        prompt_fingerprint: Set(job.prompt_fingerprint.clone()),
        params: Set(job.params.clone()),
        provider_task_id: Set(job.provider_task_id.clone()),
        status: Set(job.status.to_string()),
        result_urls: Set(json!(job.result_urls)),
        result_text: Set(job.result_text.clone()),
        error_code: Set(job.error_code.clone()),
        error_message: Set(job.error_message.clone()),
        price: Set(job.price.to_string()),
        sku_id: Set(job.sku_id.clone()),
        free: Set(job.free),
        prompt: Set(job.prompt.clone()),
        created_at: Set(job.created_at.into()),
        updated_at: Set(job.updated_at.into()),
    }
}

fn model_to_job(model: jobs::Model) -> JobRecord {
    JobRecord {
        job_id: model.job_id,
        request_id: model.request_id,
        user_id: model.user_id,
        model_id: model.model_id,
        prompt_fingerprint: model.prompt_fingerprint,
        params: model.params,
        provider_task_id: model.provider_task_id,
        status: JobStatus::from_str(&model.status).unwrap_or_default(),
        result_urls: serde_json::from_value(model.result_urls).unwrap_or_default(),
        result_text: model.result_text,
        error_code: model.error_code,
        error_message: model.error_message,
        price: Decimal::from_str(&model.price).unwrap_or(Decimal::ZERO),
        sku_id: model.sku_id,
        free: model.free,
        prompt: model.prompt,
        created_at: model.created_at.into(),
        updated_at: model.updated_at.into(),
    }
}

pub struct PgStorage {
    db: DatabaseConnection,
    tenant: String,
}

impl PgStorage {
    pub fn new(db: DatabaseConnection, tenant: impl Into<String>) -> Self {
        Self {
            db,
            tenant: tenant.into(),
        }
    }

    /// Create the backing tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS storage_json (
                partner_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (partner_id, filename)
            )",
            "CREATE TABLE IF NOT EXISTS generation_jobs (
                job_id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL,
                request_id TEXT,
                user_id BIGINT NOT NULL,
                model_id TEXT NOT NULL,
                prompt_fingerprint TEXT,
                params JSONB NOT NULL,
                provider_task_id TEXT,
                status TEXT NOT NULL,
                result_urls JSONB NOT NULL,
                result_text TEXT,
                error_code TEXT,
                error_message TEXT,
                price TEXT NOT NULL,
                sku_id TEXT,
                free BOOLEAN NOT NULL DEFAULT FALSE,
                prompt TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_generation_jobs_status
                ON generation_jobs (partner_id, status, created_at)",
            "CREATE TABLE IF NOT EXISTS payments (
                screenshot_id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL,
                user_id BIGINT NOT NULL,
                amount TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        ] {
            self.db.execute_unprepared(statement).await?;
        }
        Ok(())
    }

    async fn load_doc<C: ConnectionTrait>(&self, conn: &C, name: &str) -> Result<Value, DbErr> {
        Ok(storage_json::Entity::find_by_id((self.tenant.clone(), name.to_string()))
            .one(conn)
            .await?
            .map(|model| model.payload)
            .unwrap_or_else(|| json!({})))
    }

    /// Row-locked variant used inside read-modify-write transactions.
    async fn load_doc_for_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        name: &str,
    ) -> Result<Value, DbErr> {
        Ok(storage_json::Entity::find_by_id((self.tenant.clone(), name.to_string()))
            .lock_exclusive()
            .one(conn)
            .await?
            .map(|model| model.payload)
            .unwrap_or_else(|| json!({})))
    }

    async fn save_doc<C: ConnectionTrait>(
        &self,
        conn: &C,
        name: &str,
        doc: &Value,
    ) -> Result<(), DbErr> {
        let active = storage_json::ActiveModel {
            partner_id: Set(self.tenant.clone()),
            filename: Set(name.to_string()),
            payload: Set(doc.clone()),
        };
        storage_json::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([
                    storage_json::Column::PartnerId,
                    storage_json::Column::Filename,
                ])
                .update_column(storage_json::Column::Payload)
                .to_owned(),
            )
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Atomic mutation of one user entry inside the `users.json` document.
    async fn update_user<R: Send>(
        &self,
        user_id: i64,
        mutate: impl FnOnce(&mut Value) -> R + Send,
    ) -> StorageResult<R> {
        let txn = self.db.begin().await?;
        let mut doc = self.load_doc_for_update(&txn, USERS_DOC).await?;
        let key = user_id.to_string();
        if !doc.get(&key).is_some_and(Value::is_object) {
            doc[&key] = json!({});
        }
        let result = mutate(doc.get_mut(&key).expect("user entry just ensured"));
        self.save_doc(&txn, USERS_DOC, &doc).await?;
        txn.commit().await?;
        Ok(result)
    }

    fn balance_of(entry: &Value) -> Decimal {
        entry
            .get("balance")
            .and_then(Value::as_str)
            .and_then(|raw| Decimal::from_str(raw).ok())
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn add_generation_job(&self, job: JobRecord) -> StorageResult<()> {
        jobs::Entity::insert(job_to_model(&job, &self.tenant))
            .on_conflict(
                OnConflict::column(jobs::Column::JobId)
                    .update_columns([
                        jobs::Column::Status,
                        jobs::Column::ProviderTaskId,
                        jobs::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        update: JobUpdate,
    ) -> StorageResult<JobRecord> {
        let txn = self.db.begin().await?;
        let model = jobs::Entity::find_by_id(job_id.to_string())
            .filter(jobs::Column::PartnerId.eq(self.tenant.clone()))
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| StorageError::JobNotFound(job_id.to_string()))?;
        let mut job = model_to_job(model);
        if update.apply(&mut job, status) {
            jobs::Entity::update(job_to_model(&job, &self.tenant))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> StorageResult<Option<JobRecord>> {
        let model = jobs::Entity::find_by_id(job_id.to_string())
            .filter(jobs::Column::PartnerId.eq(self.tenant.clone()))
            .one(&self.db)
            .await?;
        Ok(model.map(model_to_job))
    }

    async fn list_jobs_by_status(
        &self,
        statuses: &[JobStatus],
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>> {
        let status_strings: Vec<String> = statuses.iter().map(JobStatus::to_string).collect();
        let models = jobs::Entity::find()
            .filter(jobs::Column::PartnerId.eq(self.tenant.clone()))
            .filter(jobs::Column::Status.is_in(status_strings))
            .order_by_asc(jobs::Column::CreatedAt)
            .limit(limit as u64)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(model_to_job).collect())
    }

    async fn update_json_file(&self, name: &str, updater: JsonUpdater) -> StorageResult<Value> {
        let txn = self.db.begin().await?;
        let mut doc = self.load_doc_for_update(&txn, name).await?;
        updater(&mut doc);
        self.save_doc(&txn, name, &doc).await?;
        txn.commit().await?;
        Ok(doc)
    }

    async fn read_json_file(&self, name: &str) -> StorageResult<Value> {
        Ok(self.load_doc(&self.db, name).await?)
    }

    async fn get_hourly_free_usage(&self, user_id: i64) -> StorageResult<HourlyFreeUsage> {
        let doc = self.load_doc(&self.db, HOURLY_DOC).await?;
        let usage: HourlyFreeUsage = doc
            .get(user_id.to_string())
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        match usage.window_start {
            Some(window_start) if Utc::now() - window_start < ChronoDuration::hours(1) => Ok(usage),
            _ => Ok(HourlyFreeUsage::default()),
        }
    }

    async fn set_hourly_free_usage(
        &self,
        user_id: i64,
        window_start: DateTime<Utc>,
        used_count: u32,
    ) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        let mut doc = self.load_doc_for_update(&txn, HOURLY_DOC).await?;
        doc[user_id.to_string()] = serde_json::to_value(HourlyFreeUsage {
            window_start: Some(window_start),
            used_count,
        })?;
        self.save_doc(&txn, HOURLY_DOC, &doc).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn get_referral_free_bank(&self, user_id: i64) -> StorageResult<i64> {
        let doc = self.load_doc(&self.db, USERS_DOC).await?;
        Ok(doc
            .get(user_id.to_string())
            .and_then(|entry| entry.get("referral_free_bank"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    async fn set_referral_free_bank(&self, user_id: i64, value: i64) -> StorageResult<()> {
        self.update_user(user_id, |entry| {
            entry["referral_free_bank"] = json!(value.max(0));
        })
        .await
    }

    async fn get_user_balance(&self, user_id: i64) -> StorageResult<Decimal> {
        let doc = self.load_doc(&self.db, USERS_DOC).await?;
        Ok(doc
            .get(user_id.to_string())
            .map(Self::balance_of)
            .unwrap_or(Decimal::ZERO))
    }

    async fn set_user_balance(&self, user_id: i64, amount: Decimal) -> StorageResult<()> {
        self.update_user(user_id, |entry| {
            entry["balance"] = json!(amount.to_string());
        })
        .await
    }

    async fn subtract_user_balance(&self, user_id: i64, amount: Decimal) -> StorageResult<bool> {
        self.update_user(user_id, |entry| {
            let balance = Self::balance_of(entry);
            if balance < amount {
                return false;
            }
            entry["balance"] = json!((balance - amount).to_string());
            true
        })
        .await
    }

    async fn record_payment(&self, payment: PaymentRecord) -> StorageResult<bool> {
        let active = payments::ActiveModel {
            screenshot_id: Set(payment.screenshot_id.clone()),
            partner_id: Set(self.tenant.clone()),
            user_id: Set(payment.user_id),
            amount: Set(payment.amount.to_string()),
            created_at: Set(payment.created_at.into()),
        };
        let result = payments::Entity::insert(active)
            .on_conflict(
                OnConflict::column(payments::Column::ScreenshotId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(&self.db)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
