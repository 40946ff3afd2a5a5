//! Default collaborator implementations for standalone runs.
//!
//! The real deployment injects a chat-bot transport; in development and
//! stub runs the orchestrator still needs something to hand artifacts to,
//! so outbound sends are logged instead.

use async_trait::async_trait;
use domain_delivery::{
    ChatTransport, DeliveryResult, MediaGroupItem, MediaUpload,
};
use domain_generations::OrphanNotifier;
use std::sync::Arc;
use tracing::info;

/// Log-only transport used when no chat integration is wired in.
pub struct LoggingTransport;

#[async_trait]
impl ChatTransport for LoggingTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> DeliveryResult<()> {
        info!(chat_id, chars = text.len(), "send_message");
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        _caption: Option<&str>,
    ) -> DeliveryResult<()> {
        info!(chat_id, filename = %upload.filename, bytes = upload.len(), "send_photo");
        Ok(())
    }

    async fn send_video(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        _caption: Option<&str>,
    ) -> DeliveryResult<()> {
        info!(chat_id, filename = %upload.filename, bytes = upload.len(), "send_video");
        Ok(())
    }

    async fn send_audio(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        _caption: Option<&str>,
    ) -> DeliveryResult<()> {
        info!(chat_id, filename = %upload.filename, bytes = upload.len(), "send_audio");
        Ok(())
    }

    async fn send_voice(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        _caption: Option<&str>,
    ) -> DeliveryResult<()> {
        info!(chat_id, filename = %upload.filename, bytes = upload.len(), "send_voice");
        Ok(())
    }

    async fn send_animation(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        _caption: Option<&str>,
    ) -> DeliveryResult<()> {
        info!(chat_id, filename = %upload.filename, bytes = upload.len(), "send_animation");
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        _caption: Option<&str>,
    ) -> DeliveryResult<()> {
        info!(chat_id, filename = %upload.filename, bytes = upload.len(), "send_document");
        Ok(())
    }

    async fn send_media_group(
        &self,
        chat_id: i64,
        items: Vec<MediaGroupItem>,
    ) -> DeliveryResult<()> {
        info!(chat_id, items = items.len(), "send_media_group");
        Ok(())
    }
}

/// Orphan notifications routed through the chat transport.
pub struct TransportOrphanNotifier {
    transport: Arc<dyn ChatTransport>,
}

impl TransportOrphanNotifier {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl OrphanNotifier for TransportOrphanNotifier {
    async fn notify_orphan(&self, user_id: i64, model_id: &str) -> Result<(), String> {
        let text = format!(
            "Your generation with {model_id} stalled before a task was created.\n\
             We could not recover it automatically - please retry."
        );
        self.transport
            .send_message(user_id, &text)
            .await
            .map_err(|e| e.to_string())
    }
}
