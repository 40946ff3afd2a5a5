use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// Owner-checked release: delete only when the stored value is still ours,
/// so a lock reclaimed by TTL and re-acquired elsewhere is never clobbered.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// `SET key value NX EX ttl`; returns whether the lock was taken.
pub(crate) async fn try_acquire(
    conn: &ConnectionManager,
    key: &str,
    value: &str,
    ttl_seconds: u64,
) -> redis::RedisResult<bool> {
    let mut conn = conn.clone();
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(value)
        .arg("NX")
        .arg("EX")
        .arg(ttl_seconds)
        .query_async(&mut conn)
        .await?;
    Ok(reply.is_some())
}

/// Release the lock if still owned; logs instead of failing on errors.
pub(crate) async fn release(conn: &ConnectionManager, key: &str, value: &str) {
    let mut conn = conn.clone();
    let result: redis::RedisResult<i64> = redis::cmd("EVAL")
        .arg(RELEASE_SCRIPT)
        .arg(1)
        .arg(key)
        .arg(value)
        .query_async(&mut conn)
        .await;
    match result {
        Ok(1) => debug!(key = %key, "LOCK_RELEASED"),
        Ok(_) => debug!(key = %key, "LOCK_RELEASE_SKIPPED (not owner)"),
        Err(e) => warn!(key = %key, error = %e, "LOCK_RELEASE_ERROR"),
    }
}

/// Lock value identifying this holder: `<pid>:<random-token>`.
pub(crate) fn owner_token() -> String {
    format!("{}:{:016x}", std::process::id(), rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_token_is_unique_per_call() {
        let a = owner_token();
        let b = owner_token();
        assert_ne!(a, b);
        let pid_prefix = format!("{}:", std::process::id());
        assert!(a.starts_with(&pid_prefix));
    }
}
