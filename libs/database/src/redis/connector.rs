use std::time::Duration;

use core_config::redis::RedisConfig;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::timeout;
use tracing::info;

use crate::common::{retry, retry_with_backoff, RetryConfig};

/// Connect to Redis and return a ConnectionManager.
///
/// The ConnectionManager handles reconnection internally. The connect
/// deadline is enforced here so callers degrade fast when Redis is down.
pub async fn connect(url: &str, connect_deadline: Duration) -> redis::RedisResult<ConnectionManager> {
    info!(deadline_ms = %connect_deadline.as_millis(), "Attempting to connect to Redis");

    let client = Client::open(url)?;
    let manager = timeout(connect_deadline, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            redis::RedisError::from((
                redis::ErrorKind::Io,
                "redis connect deadline exceeded",
            ))
        })??;

    // Verify connection with PING
    let mut conn = manager.clone();
    let _: String = timeout(connect_deadline, redis::cmd("PING").query_async(&mut conn))
        .await
        .map_err(|_| {
            redis::RedisError::from((redis::ErrorKind::Io, "redis ping deadline exceeded"))
        })??;

    info!("Successfully connected to Redis");
    Ok(manager)
}

/// Connect using a `RedisConfig`; errors when no URL is configured.
pub async fn connect_from_config(config: &RedisConfig) -> redis::RedisResult<ConnectionManager> {
    let url = config.url.as_deref().ok_or_else(|| {
        redis::RedisError::from((redis::ErrorKind::InvalidClientConfig, "REDIS_URL not set"))
    })?;
    connect(url, config.connect_timeout).await
}

/// Connect to Redis with automatic retry on failure.
pub async fn connect_with_retry(
    url: &str,
    connect_deadline: Duration,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    let url_owned = url.to_string();

    match retry_config {
        Some(config) => {
            retry_with_backoff(|| connect(&url_owned, connect_deadline), config).await
        }
        None => retry(|| connect(&url_owned, connect_deadline)).await,
    }
}
