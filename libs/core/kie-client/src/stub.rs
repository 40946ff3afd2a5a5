//! In-memory provider simulator, selected via `KIE_STUB=1` or whenever no
//! API key is configured. Tasks walk `waiting -> generating -> success` and
//! fabricate result URLs by model kind.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{KieError, KieResult};
use crate::types::{ProviderState, TaskHandle, TaskRecord};
use crate::ProviderClient;

#[derive(Debug, Clone)]
struct StubTask {
    model: String,
    state: &'static str,
    result_urls: Vec<String>,
    result_text: Option<String>,
    canceled: bool,
}

/// Simulated KIE API.
pub struct KieStub {
    tasks: Arc<Mutex<HashMap<String, StubTask>>>,
    /// Delay per simulated state hop
    step_delay: Duration,
}

impl Default for KieStub {
    fn default() -> Self {
        Self::new()
    }
}

impl KieStub {
    pub fn new() -> Self {
        Self::with_step_delay(Duration::from_millis(100))
    }

    pub fn with_step_delay(step_delay: Duration) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            step_delay,
        }
    }

    fn fabricate_result(model: &str, task_id: &str) -> (Vec<String>, Option<String>) {
        let model = model.to_lowercase();
        if model.contains("image") {
            (
                vec![format!("https://cdn.kie.example/generated/image_{task_id}.png")],
                None,
            )
        } else if model.contains("video") {
            (
                vec![format!("https://cdn.kie.example/generated/video_{task_id}.mp4")],
                None,
            )
        } else if model.contains("audio") || model.contains("voice") || model.contains("tts") {
            (
                vec![format!("https://cdn.kie.example/generated/audio_{task_id}.mp3")],
                None,
            )
        } else {
            (Vec::new(), Some(format!("Stub result for task {task_id}")))
        }
    }

    fn advance(tasks: &Arc<Mutex<HashMap<String, StubTask>>>, task_id: &str) {
        let mut tasks = tasks.lock().expect("stub task map poisoned");
        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        if task.canceled {
            task.state = "canceled";
            return;
        }
        task.state = match task.state {
            "waiting" => "generating",
            "generating" => {
                let (urls, text) = Self::fabricate_result(&task.model, task_id);
                task.result_urls = urls;
                task.result_text = text;
                "success"
            }
            other => other,
        };
        debug!(task_id = %task_id, state = %task.state, "stub task advanced");
    }
}

#[async_trait]
impl ProviderClient for KieStub {
    async fn create_task(
        &self,
        model: &str,
        _input: &Value,
        _callback_url: Option<&str>,
        correlation_id: &str,
    ) -> KieResult<TaskHandle> {
        let task_id = Uuid::new_v4().to_string();
        self.tasks.lock().expect("stub task map poisoned").insert(
            task_id.clone(),
            StubTask {
                model: model.to_string(),
                state: "waiting",
                result_urls: Vec::new(),
                result_text: None,
                canceled: false,
            },
        );

        let tasks = Arc::clone(&self.tasks);
        let step_delay = self.step_delay;
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(step_delay).await;
            Self::advance(&tasks, &spawned_id);
            tokio::time::sleep(step_delay).await;
            Self::advance(&tasks, &spawned_id);
        });

        info!(
            action = "KIE_CREATE",
            model = %model,
            task_id = %task_id,
            correlation_id = %correlation_id,
            "stub task created"
        );
        Ok(TaskHandle {
            task_id,
            correlation_id: correlation_id.to_string(),
        })
    }

    async fn get_task_status(&self, task_id: &str, correlation_id: &str) -> KieResult<TaskRecord> {
        let tasks = self.tasks.lock().expect("stub task map poisoned");
        let Some(task) = tasks.get(task_id) else {
            return Err(KieError::Validation {
                message: "Task not found".to_string(),
                correlation_id: correlation_id.to_string(),
            });
        };
        let result_json = if task.state == "success" {
            Some(
                serde_json::json!({
                    "resultUrls": task.result_urls,
                    "resultText": task.result_text,
                })
                .to_string(),
            )
        } else {
            None
        };
        Ok(TaskRecord {
            task_id: task_id.to_string(),
            state: ProviderState::parse(Some(task.state)),
            state_raw: Some(task.state.to_string()),
            result_json,
            result_urls: task.result_urls.clone(),
            result_text: task.result_text.clone(),
            fail_code: None,
            fail_msg: None,
            error_message: None,
            complete_time: None,
            create_time: None,
            correlation_id: correlation_id.to_string(),
        })
    }

    async fn cancel_task(&self, task_id: &str, _correlation_id: &str) -> KieResult<()> {
        let mut tasks = self.tasks.lock().expect("stub task map poisoned");
        if let Some(task) = tasks.get_mut(task_id) {
            task.canceled = true;
            if !ProviderState::parse(Some(task.state)).is_terminal() {
                task.state = "canceled";
            }
        }
        Ok(())
    }

    async fn get_download_url(&self, source_url: &str, _correlation_id: &str) -> KieResult<String> {
        Ok(source_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stub_progresses_to_success() {
        let stub = KieStub::with_step_delay(Duration::from_millis(5));
        let handle = stub
            .create_task("flux/text-to-image", &json!({"prompt": "cat"}), None, "corr")
            .await
            .unwrap();

        let record = stub
            .wait_for_task(
                &handle.task_id,
                Duration::from_secs(2),
                Duration::from_millis(10),
                "corr",
            )
            .await
            .unwrap();
        assert_eq!(record.state, ProviderState::Succeeded);
        assert_eq!(record.result_urls.len(), 1);
        assert!(record.result_urls[0].ends_with(".png"));
        assert!(record.result_json.is_some());
    }

    #[tokio::test]
    async fn test_stub_text_model_yields_text() {
        let stub = KieStub::with_step_delay(Duration::from_millis(5));
        let handle = stub
            .create_task("gpt/chat", &json!({"prompt": "hi"}), None, "corr")
            .await
            .unwrap();
        let record = stub
            .wait_for_task(
                &handle.task_id,
                Duration::from_secs(2),
                Duration::from_millis(10),
                "corr",
            )
            .await
            .unwrap();
        assert!(record.result_urls.is_empty());
        assert!(record.result_text.is_some());
    }

    #[tokio::test]
    async fn test_stub_cancel_sticks() {
        let stub = KieStub::with_step_delay(Duration::from_millis(20));
        let handle = stub
            .create_task("flux/text-to-image", &json!({}), None, "corr")
            .await
            .unwrap();
        stub.cancel_task(&handle.task_id, "corr").await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let record = stub.get_task_status(&handle.task_id, "corr").await.unwrap();
        assert_eq!(record.state, ProviderState::Canceled);
    }

    #[tokio::test]
    async fn test_stub_unknown_task() {
        let stub = KieStub::new();
        let err = stub.get_task_status("missing", "corr").await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
