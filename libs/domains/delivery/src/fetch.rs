//! Artifact download with fixed-schedule retries.

use std::time::Duration;
use tracing::debug;

use crate::error::{DeliveryError, DeliveryResult};
use crate::sniff::normalize_content_type;

const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];
const DEFAULT_ATTEMPTS: usize = 4;

/// One downloaded artifact.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub url: String,
    pub data: Vec<u8>,
    pub content_type: String,
    pub size_bytes: u64,
}

/// GET with up to four attempts and a 0.5/1/2s backoff ladder.
pub async fn download_with_retries(
    http: &reqwest::Client,
    url: &str,
) -> DeliveryResult<DownloadTarget> {
    let mut last_error = String::new();
    for attempt in 0..DEFAULT_ATTEMPTS {
        match try_download(http, url).await {
            Ok(target) => {
                debug!(
                    url_host = %target_host(url),
                    size = target.size_bytes,
                    content_type = %target.content_type,
                    attempt = attempt + 1,
                    "artifact downloaded"
                );
                return Ok(target);
            }
            Err(e) => {
                last_error = e;
                if attempt < DEFAULT_ATTEMPTS - 1 {
                    let delay = BACKOFF_SCHEDULE[attempt.min(BACKOFF_SCHEDULE.len() - 1)];
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(DeliveryError::Download(last_error))
}

async fn try_download(http: &reqwest::Client, url: &str) -> Result<DownloadTarget, String> {
    let response = http.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(format!("HTTP {status}"));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(normalize_content_type)
        .unwrap_or_default();
    let declared_length = response.content_length();
    let data = response.bytes().await.map_err(|e| e.to_string())?;
    let size_bytes = declared_length.unwrap_or(data.len() as u64);
    Ok(DownloadTarget {
        url: url.to_string(),
        data: data.to_vec(),
        content_type,
        size_bytes,
    })
}

fn target_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_host() {
        assert_eq!(target_host("https://cdn.example.com/a.png"), "cdn.example.com");
        assert_eq!(target_host("garbage"), "unknown");
    }

    #[tokio::test]
    async fn test_download_unreachable_host_fails_after_retries() {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        // Reserved TEST-NET address: connection refused / timeout.
        let started = std::time::Instant::now();
        let result = download_with_retries(&http, "http://192.0.2.1/x.png").await;
        assert!(result.is_err());
        // Three backoff sleeps of 0.5 + 1 + 2 seconds.
        assert!(started.elapsed() >= Duration::from_millis(3500));
    }
}
