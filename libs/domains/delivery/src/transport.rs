//! Chat transport seam.
//!
//! The orchestrator never talks to a messaging API directly; it hands typed
//! payloads to this trait. Message rendering, keyboards, and translations
//! live entirely behind it.

use async_trait::async_trait;

use crate::error::DeliveryResult;

/// A downloaded artifact ready for upload.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Kind tag for media group members (only photos and videos group).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKindTag {
    Photo,
    Video,
}

#[derive(Debug, Clone)]
pub struct MediaGroupItem {
    pub kind: MediaKindTag,
    pub upload: MediaUpload,
    pub caption: Option<String>,
}

/// Outbound chat operations used by the delivery pipeline.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> DeliveryResult<()>;

    async fn send_photo(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
    ) -> DeliveryResult<()>;

    async fn send_video(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
    ) -> DeliveryResult<()>;

    async fn send_audio(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
    ) -> DeliveryResult<()>;

    async fn send_voice(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
    ) -> DeliveryResult<()>;

    async fn send_animation(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
    ) -> DeliveryResult<()>;

    async fn send_document(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
    ) -> DeliveryResult<()>;

    /// Ship sibling photos/videos as one album.
    async fn send_media_group(
        &self,
        chat_id: i64,
        items: Vec<MediaGroupItem>,
    ) -> DeliveryResult<()>;
}
