//! Redis-backed window store for multi-instance deployments.
//!
//! Each window key is a sorted set scored by arrival time in milliseconds.
//! Under [`DeniedRequestPolicy::Record`] a decision is one `MULTI`/`EXEC`
//! pipeline:
//!
//! 1. `ZREMRANGEBYSCORE key 0 <now - window>`
//! 2. `ZCARD key`
//! 3. `ZADD key <now> <member>`
//! 4. `EXPIRE key <window>`
//!
//! Under [`DeniedRequestPolicy::Discard`] the add depends on the count, so
//! the same steps run inside a Lua script instead.

use async_trait::async_trait;
use redis::{Client, Script};
use tracing::{debug, info, trace};

use super::pool::{PoolSettings, SessionPool};
use super::WindowStore;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ratelimit::{BatchOutcome, DeniedRequestPolicy, WindowBatch};

/// Evict, count, add only when below quota, expire. Returns the prior count.
const DISCARD_DENIED_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[5]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
end
redis.call('EXPIRE', KEYS[1], ARGV[4])
return count
"#;

/// Window store backed by a Redis server.
pub struct RedisWindowStore {
    pool: SessionPool,
    endpoint: String,
    discard_script: Script,
}

impl RedisWindowStore {
    /// Create a store for the configured endpoint without touching the network.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url())?;
        Ok(Self {
            pool: SessionPool::new(client, PoolSettings::from(config)),
            endpoint: config.endpoint(),
            discard_script: Script::new(DISCARD_DENIED_SCRIPT),
        })
    }

    /// Create a store and open its minimum idle sessions.
    ///
    /// A failure while warming is not fatal here; the limiter's liveness
    /// probe decides whether the store is usable.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self::open(config)?;
        match store.pool.warm().await {
            Ok(opened) => info!(endpoint = %store.endpoint, sessions = opened, "Connected to Redis"),
            Err(e) => debug!(endpoint = %store.endpoint, error = %e, "Could not warm session pool"),
        }
        Ok(store)
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    async fn run_pipeline(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        batch: &WindowBatch,
    ) -> Result<u64, StoreError> {
        let timeout = self.pool.settings().timeout;
        let key = batch.key.as_str();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(batch.evict_until_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZADD")
            .arg(key)
            .arg(batch.member.score)
            .arg(&batch.member.value)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(batch.ttl_secs)
            .ignore();

        let (count,): (u64,) = tokio::time::timeout(timeout, pipe.query_async(conn))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(count)
    }

    async fn run_script(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        batch: &WindowBatch,
    ) -> Result<u64, StoreError> {
        let timeout = self.pool.settings().timeout;

        let mut invocation = self.discard_script.prepare_invoke();
        invocation
            .key(batch.key.as_str())
            .arg(batch.evict_until_ms)
            .arg(batch.member.score)
            .arg(&batch.member.value)
            .arg(batch.ttl_secs)
            .arg(batch.max_requests);

        let count: u64 = tokio::time::timeout(timeout, invocation.invoke_async(conn))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(count)
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut session = self.pool.get().await?;
        let result = self.pool.probe(session.connection()).await;
        session.observe(&result);
        result?;
        session.release().await;
        Ok(())
    }

    async fn apply(&self, batch: &WindowBatch) -> Result<BatchOutcome, StoreError> {
        let mut session = self.pool.get().await?;

        let result = match batch.policy {
            DeniedRequestPolicy::Record => self.run_pipeline(session.connection(), batch).await,
            DeniedRequestPolicy::Discard => self.run_script(session.connection(), batch).await,
        };
        session.observe(&result);
        let prior_count = result?;
        session.release().await;

        trace!(
            key = %batch.key,
            prior_count = prior_count,
            policy = ?batch.policy,
            "Applied window batch"
        );

        Ok(BatchOutcome { prior_count })
    }

    async fn close(&self) {
        if self.pool.close() {
            info!(endpoint = %self.endpoint, "Redis session pool closed");
        }
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_does_not_connect() {
        let config = StoreConfig::new("127.0.0.1", 1);
        let store = RedisWindowStore::open(&config).unwrap();
        assert_eq!(store.endpoint(), "127.0.0.1:1");
        assert_eq!(store.pool().idle_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_fails_against_unreachable_store() {
        let mut config = StoreConfig::new("127.0.0.1", 1);
        config.timeout_ms = 200;
        let store = RedisWindowStore::open(&config).unwrap();

        let result = store.ping().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_apply_after_close_reports_pool_closed() {
        let store = RedisWindowStore::open(&StoreConfig::new("127.0.0.1", 1)).unwrap();
        store.close().await;
        store.close().await;

        let batch = WindowBatch::new(
            crate::ratelimit::WindowKey::new("rate_limiter:", "u"),
            1_000,
            1,
            5,
            DeniedRequestPolicy::Record,
        );
        let result = store.apply(&batch).await;
        assert!(matches!(result, Err(StoreError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out_instead_of_hanging() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = StoreConfig::new("127.0.0.1", port);
        config.timeout_ms = 200;
        let store = RedisWindowStore::open(&config).unwrap();
        let batch = WindowBatch::new(
            crate::ratelimit::WindowKey::new("rate_limiter:", "u"),
            1_000,
            1,
            5,
            DeniedRequestPolicy::Record,
        );

        let started = std::time::Instant::now();
        let result = store.apply(&batch).await;

        match result {
            Err(StoreError::Timeout(bound)) => assert_eq!(bound, std::time::Duration::from_millis(200)),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        // The slot is free again for the next caller.
        assert_eq!(store.pool().available(), config.pool_size);
    }

    #[test]
    fn test_discard_script_follows_batch_order() {
        let evict = DISCARD_DENIED_SCRIPT.find("ZREMRANGEBYSCORE").unwrap();
        let count = DISCARD_DENIED_SCRIPT.find("ZCARD").unwrap();
        let add = DISCARD_DENIED_SCRIPT.find("ZADD").unwrap();
        let expire = DISCARD_DENIED_SCRIPT.find("EXPIRE").unwrap();
        assert!(evict < count && count < add && add < expire);
    }
}
