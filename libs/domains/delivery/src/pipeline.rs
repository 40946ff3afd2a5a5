//! Transport mechanics for one job result: fetch, sniff, classify, ship.

use core_config::delivery::DeliveryConfig;
use domain_generations::{is_valid_result_url, JobResult};
use kie_client::ProviderClient;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::fetch::download_with_retries;
use crate::sniff::{
    derive_filename, is_textual_type, looks_like_html, method_for_type, resolve_real_mime,
    TransportMethod,
};
use crate::transport::{ChatTransport, MediaGroupItem, MediaKindTag, MediaUpload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UrlOutcome {
    /// Artifact shipped as media or document
    Sent,
    /// Artifact handed over as a plain URL (size limit)
    UrlFallback,
    /// Nothing usable reached the user for this URL
    Failed,
}

struct PreparedUpload {
    method: TransportMethod,
    upload: MediaUpload,
    source_url: String,
}

fn short_error_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct DeliveryPipeline {
    transport: Arc<dyn ChatTransport>,
    provider: Arc<dyn ProviderClient>,
    http: reqwest::Client,
    config: DeliveryConfig,
}

impl DeliveryPipeline {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        provider: Arc<dyn ProviderClient>,
        config: DeliveryConfig,
    ) -> Result<Self, crate::error::DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()
            .map_err(|e| crate::error::DeliveryError::Download(e.to_string()))?;
        Ok(Self {
            transport,
            provider,
            http,
            config,
        })
    }

    fn is_provider_url(&self, url: &str) -> bool {
        let Some(base) = self.provider.base_url() else {
            return false;
        };
        let base_host = Url::parse(base).ok().and_then(|u| u.host_str().map(str::to_string));
        let url_host = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));
        match (base_host, url_host) {
            (Some(base), Some(host)) => base == host,
            _ => false,
        }
    }

    async fn send_url_fallback(&self, chat_id: i64, url: &str, reason: &str) {
        let error_id = short_error_id();
        let text = format!("Could not deliver the file directly ({reason}).\nLink: {url}\nID: {error_id}");
        if let Err(e) = self.transport.send_message(chat_id, &text).await {
            warn!(chat_id, error = %e, "URL fallback message failed");
        }
    }

    /// Ship one result to the chat. Returns whether the user ended up with
    /// every artifact (as media, document, or size-limited URL).
    pub async fn deliver(
        &self,
        result: &JobResult,
        chat_id: i64,
        correlation_id: &str,
        caption: Option<&str>,
        filename_prefix: Option<&str>,
    ) -> bool {
        info!(
            action = "TG_DELIVER",
            correlation_id = %correlation_id,
            chat_id,
            media_type = %result.media_type,
            urls = result.urls.len(),
            "delivery started"
        );

        // Text results ship as one message.
        if result.urls.is_empty() {
            let Some(text) = result.text.as_deref().filter(|text| !text.is_empty()) else {
                let text = format!("No result to send.\nID: {correlation_id}");
                let _ = self.transport.send_message(chat_id, &text).await;
                return false;
            };
            return match self.transport.send_message(chat_id, text).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        action = "TG_DELIVER",
                        correlation_id = %correlation_id,
                        error = %e,
                        error_code = "TG_DELIVER_FAILED",
                        "text delivery failed"
                    );
                    false
                }
            };
        }

        let mut outcomes: Vec<UrlOutcome> = Vec::new();
        let mut prepared: Vec<PreparedUpload> = Vec::new();

        for (index, url) in result.urls.iter().enumerate() {
            if !is_valid_result_url(url) {
                warn!(
                    action = "TG_DELIVER",
                    correlation_id = %correlation_id,
                    error_code = "INVALID_RESULT_URL",
                    "refusing to deliver malformed URL"
                );
                let text = format!(
                    "The result link is broken; please retry the generation.\nID: {correlation_id}"
                );
                let _ = self.transport.send_message(chat_id, &text).await;
                outcomes.push(UrlOutcome::Failed);
                continue;
            }

            // Provider-hosted links go through the download-url resolver.
            let mut resolved_url = url.clone();
            if self.is_provider_url(url) {
                match self.provider.get_download_url(url, correlation_id).await {
                    Ok(direct) => resolved_url = direct,
                    Err(e) => {
                        warn!(error = %e, "download-url resolution failed, using original link");
                    }
                }
            }

            let target = match download_with_retries(&self.http, &resolved_url).await {
                Ok(target) => target,
                Err(e) => {
                    warn!(
                        action = "TG_DELIVER",
                        correlation_id = %correlation_id,
                        error = %e,
                        error_code = "TG_DELIVER_FAILED",
                        "artifact download failed"
                    );
                    self.send_url_fallback(chat_id, &resolved_url, "download failed").await;
                    outcomes.push(UrlOutcome::Failed);
                    continue;
                }
            };

            let real_type = resolve_real_mime(&target.content_type, &target.data, &target.url);
            if looks_like_html(&target.data, &real_type) {
                warn!(
                    action = "TG_DELIVER",
                    correlation_id = %correlation_id,
                    error_code = "KIE_RESULT_INVALID_CONTENT",
                    "result URL served an HTML page instead of media"
                );
                let text = format!(
                    "The provider returned a web page instead of media.\n{url}\nID: {correlation_id}"
                );
                let _ = self.transport.send_message(chat_id, &text).await;
                outcomes.push(UrlOutcome::Failed);
                continue;
            }

            // Exactly at the limit still uploads; one byte over falls back.
            if target.size_bytes > self.config.safe_upload_bytes {
                info!(
                    action = "TG_DELIVER",
                    correlation_id = %correlation_id,
                    size = target.size_bytes,
                    limit = self.config.safe_upload_bytes,
                    error_code = "TG_MEDIA_TOO_LARGE",
                    "artifact exceeds safe upload size, sending URL"
                );
                let text =
                    format!("The file is too large for direct upload.\n{resolved_url}\nID: {correlation_id}");
                match self.transport.send_message(chat_id, &text).await {
                    Ok(()) => outcomes.push(UrlOutcome::UrlFallback),
                    Err(_) => outcomes.push(UrlOutcome::Failed),
                }
                continue;
            }

            let filename = derive_filename(&target.url, &real_type, index + 1, filename_prefix);
            let upload = MediaUpload {
                filename,
                content_type: real_type.clone(),
                bytes: target.data,
            };
            let method = if is_textual_type(&real_type) {
                TransportMethod::SendDocument
            } else {
                method_for_type(&real_type)
            };
            prepared.push(PreparedUpload {
                method,
                upload,
                source_url: target.url,
            });
        }

        // Sibling photos/videos ship as one media group.
        let groupable = prepared.len() > 1
            && prepared
                .iter()
                .all(|item| matches!(item.method, TransportMethod::SendPhoto | TransportMethod::SendVideo));
        if groupable {
            let items: Vec<MediaGroupItem> = prepared
                .iter()
                .enumerate()
                .map(|(index, item)| MediaGroupItem {
                    kind: if item.method == TransportMethod::SendPhoto {
                        MediaKindTag::Photo
                    } else {
                        MediaKindTag::Video
                    },
                    upload: item.upload.clone(),
                    caption: if index == 0 {
                        caption.map(str::to_string)
                    } else {
                        None
                    },
                })
                .collect();
            match self.transport.send_media_group(chat_id, items).await {
                Ok(()) => outcomes.extend(prepared.iter().map(|_| UrlOutcome::Sent)),
                Err(e) => {
                    warn!(error = %e, "media group send failed, falling back to URLs");
                    for item in &prepared {
                        self.send_url_fallback(chat_id, &item.source_url, "transport error")
                            .await;
                        outcomes.push(UrlOutcome::Failed);
                    }
                }
            }
        } else {
            for (index, item) in prepared.iter().enumerate() {
                let item_caption = if index == 0 { caption } else { None };
                let sent = match item.method {
                    TransportMethod::SendPhoto => {
                        self.transport
                            .send_photo(chat_id, item.upload.clone(), item_caption)
                            .await
                    }
                    TransportMethod::SendVideo => {
                        self.transport
                            .send_video(chat_id, item.upload.clone(), item_caption)
                            .await
                    }
                    TransportMethod::SendAudio => {
                        self.transport
                            .send_audio(chat_id, item.upload.clone(), item_caption)
                            .await
                    }
                    TransportMethod::SendVoice => {
                        self.transport
                            .send_voice(chat_id, item.upload.clone(), item_caption)
                            .await
                    }
                    TransportMethod::SendAnimation => {
                        self.transport
                            .send_animation(chat_id, item.upload.clone(), item_caption)
                            .await
                    }
                    TransportMethod::SendDocument => {
                        self.transport
                            .send_document(chat_id, item.upload.clone(), item_caption)
                            .await
                    }
                };
                match sent {
                    Ok(()) => outcomes.push(UrlOutcome::Sent),
                    Err(e) => {
                        let error_id = short_error_id();
                        warn!(
                            action = "TG_DELIVER",
                            correlation_id = %correlation_id,
                            error = %e,
                            error_id = %error_id,
                            error_code = "TG_DELIVER_FAILED",
                            "transport send failed"
                        );
                        self.send_url_fallback(chat_id, &item.source_url, "transport error")
                            .await;
                        outcomes.push(UrlOutcome::Failed);
                    }
                }
            }
        }

        let delivered = !outcomes.is_empty()
            && outcomes
                .iter()
                .all(|outcome| *outcome != UrlOutcome::Failed);
        info!(
            action = "TG_DELIVER",
            correlation_id = %correlation_id,
            delivered,
            items = outcomes.len(),
            "delivery finished"
        );
        delivered
    }
}
