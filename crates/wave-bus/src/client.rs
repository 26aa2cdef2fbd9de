//! Redis connection handling for the bus.

use std::env;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

/// Default Redis URL when `REDIS_URL` is unset.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Resolve the Redis URL from the environment.
pub fn redis_url_from_env() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_owned())
}

/// Open a managed async connection to Redis.
///
/// The returned [`ConnectionManager`] is cheap to clone and reconnects
/// automatically, so one manager is shared across publishers, the queue,
/// and subscribers.
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)
        .with_context(|| format!("invalid Redis URL: {url}"))?;
    let manager = client
        .get_connection_manager()
        .await
        .with_context(|| format!("failed to connect to Redis at {url}"))?;
    Ok(manager)
}

/// Check connectivity with a PING.
pub async fn ping(conn: &ConnectionManager) -> bool {
    let mut conn = conn.clone();
    redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .is_ok()
}
