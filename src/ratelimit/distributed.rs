//! Redis-backed counter store.
//!
//! Every node that points at the same Redis instance shares the same windows,
//! which is what makes the limit hold across a horizontally scaled service.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{info, trace};

use super::backend::CounterStore;
use super::counter::WindowHit;
use crate::error::{RatewallError, Result};

/// Increment and conditionally expire in one atomic step.
///
/// `PEXPIRE` only runs when the key carries no TTL, so the increment that
/// creates a window fixes its expiry and later increments leave it alone.
const INCR_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// A counter store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    /// Auto-reconnecting multiplexed connection
    conn: ConnectionManager,
    /// The increment script, loaded lazily via `EVALSHA`
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("script", &self.script.get_hash())
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RatewallError::InvalidConfig(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to Redis counter store");

        Ok(Self {
            conn,
            script: Script::new(INCR_WITH_EXPIRY),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<WindowHit> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn.clone();

        let (count, remaining_ms): (u64, i64) = self
            .script
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, count, remaining_ms, "Redis window incremented");

        let ttl = if remaining_ms < 0 {
            ttl
        } else {
            Duration::from_millis(remaining_ms as u64)
        };

        Ok(WindowHit { count, ttl })
    }
}
