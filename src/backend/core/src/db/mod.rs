//! Redis client layer: connection handling, health probe and key-space
//! namespacing.

pub mod keys;

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::warn;

use crate::error::Result;

/// Maximum number of startup pings before giving up on the backend.
const PING_MAX_TIMES: u32 = 10;

/// Dial timeout when establishing a connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper around the Redis client handing out multiplexed
/// connections. Cloning is cheap; all components share one client.
#[derive(Clone)]
pub struct RedisPool {
    client: redis::Client,
    namespace: String,
}

impl RedisPool {
    /// Create a pool for the given URL and key-space namespace.
    ///
    /// The namespace is wrapped in braces so that all keys of one
    /// deployment share a cluster hash slot.
    pub fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            namespace: format!("{{{}}}", namespace),
        })
    }

    /// The brace-wrapped namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Obtain an async multiplexed connection.
    pub async fn conn(&self) -> Result<MultiplexedConnection> {
        let connect = self.client.get_multiplexed_async_connection();
        match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(crate::error::StevedoreError::with_internal(
                crate::error::ErrorCode::BackendUnreachable,
                "unable to reach the job backend",
                "redis dial timed out",
            )),
        }
    }

    /// Obtain a dedicated pub/sub connection.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        let conn = self.client.get_async_connection().await?;
        Ok(conn.into_pubsub())
    }

    /// Ping the server, retrying up to [`PING_MAX_TIMES`] with
    /// exponential backoff before surfacing the last error.
    pub async fn ping_with_retry(&self) -> Result<()> {
        let mut last_err = None;

        for count in 1..=PING_MAX_TIMES {
            match self.try_ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt = count, error = %e, "redis ping failed");
                    last_err = Some(e);
                }
            }
            let delay = 2u64.pow(count).min(30);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        Err(last_err.expect("at least one ping attempt was made"))
    }

    async fn try_ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_brace_wrapped() {
        let pool = RedisPool::new("redis://localhost:6379", "testing").unwrap();
        assert_eq!(pool.namespace(), "{testing}");
    }
}
