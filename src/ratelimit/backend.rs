//! Counter store abstraction and the in-process implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::counter::{WindowCounter, WindowHit};
use crate::error::Result;

/// Trait for counter stores backing the fixed-window limiter.
///
/// Implementations must make `incr_with_expiry` atomic per key: the increment
/// and the conditional expiry are one indivisible step, and concurrent callers
/// on the same key each observe a distinct count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key` by one and return the new count with the
    /// time left in its window.
    ///
    /// The `ttl` is applied only when this increment creates the key.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<WindowHit>;
}

/// In-process counter store.
///
/// Windows live in a sharded map; the shard lock held by the entry API makes
/// each increment atomic. Expired windows are replaced lazily on the next
/// increment and can be dropped in bulk with [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, WindowCounter>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every window whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Spawn a background task that purges expired windows every `interval`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged expired rate limit windows");
                }
            }
        })
    }

    /// Current count for `key`, or `None` when no live window exists.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.windows
            .get(key)
            .filter(|window| !window.is_expired(now))
            .map(|window| window.count())
    }

    /// Number of windows held, live or not yet purged.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether the store holds no windows.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<WindowHit> {
        let now = Instant::now();
        let mut window = self.windows.entry(key.to_string()).or_insert_with(|| {
            trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "Opening rate limit window");
            WindowCounter::new(now, ttl)
        });

        Ok(window.increment(now, ttl))
    }
}
