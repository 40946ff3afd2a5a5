//! Delivery records: the CAS ledger that makes delivery (and therefore
//! billing) exactly-once per `(user, task)`.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storage::{DeliveryState, Storage, StorageResult};

pub const DELIVERY_RECORDS_FILE: &str = "delivery_records.json";

fn delivery_key(user_id: i64, task_id: &str) -> String {
    format!("{user_id}:{task_id}")
}

/// Reserve the `(user, task)` delivery slot (`absent -> delivering`).
///
/// Returns `true` when the slot is already `delivered`, in which case the
/// caller must not deliver again.
pub async fn reserve_delivery(
    storage: &dyn Storage,
    user_id: i64,
    task_id: &str,
    job_id: Option<&str>,
    model_id: Option<&str>,
    request_id: Option<&str>,
) -> StorageResult<bool> {
    let already_delivered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&already_delivered);
    let key = delivery_key(user_id, task_id);
    let task_id = task_id.to_string();
    let job_id = job_id.map(str::to_string);
    let model_id = model_id.map(str::to_string);
    let request_id = request_id.map(str::to_string);

    storage
        .update_json_file(
            DELIVERY_RECORDS_FILE,
            Box::new(move |doc| {
                let now_iso = Utc::now().to_rfc3339();
                let record = doc.get(&key).cloned().unwrap_or_else(|| json!({}));
                let delivered = record
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<DeliveryState>().ok())
                    == Some(DeliveryState::Delivered);
                if delivered {
                    flag.store(true, Ordering::SeqCst);
                    return;
                }
                let attempts = record.get("attempts").and_then(Value::as_u64).unwrap_or(0) + 1;
                let created_at = record
                    .get("created_at")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| now_iso.clone());
                doc[&key] = json!({
                    "user_id": user_id,
                    "task_id": task_id,
                    "job_id": job_id,
                    "model_id": model_id,
                    "request_id": request_id,
                    "status": DeliveryState::Delivering.to_string(),
                    "attempts": attempts,
                    "created_at": created_at,
                    "updated_at": now_iso,
                });
            }),
        )
        .await?;
    Ok(already_delivered.load(Ordering::SeqCst))
}

/// Finalize the slot as `delivered` or `failed`. `delivered_at` is written
/// at most once per key.
pub async fn finalize_delivery(
    storage: &dyn Storage,
    user_id: i64,
    task_id: &str,
    success: bool,
    error: Option<&str>,
    result_urls: &[String],
) -> StorageResult<()> {
    let key = delivery_key(user_id, task_id);
    let error = error.map(str::to_string);
    let result_urls = result_urls.to_vec();

    storage
        .update_json_file(
            DELIVERY_RECORDS_FILE,
            Box::new(move |doc| {
                let now_iso = Utc::now().to_rfc3339();
                let mut record = doc.get(&key).cloned().unwrap_or_else(|| json!({}));
                let state = if success {
                    DeliveryState::Delivered
                } else {
                    DeliveryState::Failed
                };
                record["status"] = json!(state.to_string());
                record["updated_at"] = json!(now_iso);
                record["error"] = json!(error);
                if !result_urls.is_empty() || record.get("result_urls").is_none() {
                    record["result_urls"] = json!(result_urls);
                }
                if success && record.get("delivered_at").is_none() {
                    record["delivered_at"] = json!(now_iso);
                }
                doc[&key] = record;
            }),
        )
        .await?;
    Ok(())
}
