//! Rate limiting logic and state management.

mod allowlist;
mod backend;
mod counter;
mod descriptor;
#[cfg(feature = "redis")]
mod distributed;
mod limiter;
mod rules;

use std::sync::Arc;

use tracing::info;

pub use allowlist::{Allowlist, DEFAULT_WHITELIST_RANGES};
pub use backend::{CounterStore, MemoryStore};
pub use counter::{WindowCounter, WindowHit};
pub use descriptor::{IdentityKey, UNKNOWN_CLIENT};
#[cfg(feature = "redis")]
pub use distributed::RedisStore;
pub use limiter::{LimitConfig, RateDecision, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use rules::{PolicyResolver, RequestMeta};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{RatewallError, Result};

/// A counter store built from configuration.
pub enum ConfiguredStore {
    /// In-process store; the caller may want to run its sweeper
    Memory(Arc<MemoryStore>),
    /// Any shared store
    Shared(Arc<dyn CounterStore>),
}

impl ConfiguredStore {
    /// The store as a trait object for the limiter.
    pub fn as_counter_store(&self) -> Arc<dyn CounterStore> {
        match self {
            ConfiguredStore::Memory(store) => store.clone() as Arc<dyn CounterStore>,
            ConfiguredStore::Shared(store) => store.clone(),
        }
    }
}

/// Create the counter store selected by `config`.
pub async fn connect_store(config: &StoreConfig) -> Result<ConfiguredStore> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory counter store");
            Ok(ConfiguredStore::Memory(Arc::new(MemoryStore::new())))
        }
        StoreBackend::Redis => connect_redis(config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &StoreConfig) -> Result<ConfiguredStore> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| RatewallError::InvalidConfig("redis backend requires store.redis_url".into()))?;
    let store = RedisStore::connect(url).await?;
    Ok(ConfiguredStore::Shared(Arc::new(store)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &StoreConfig) -> Result<ConfiguredStore> {
    Err(RatewallError::InvalidConfig(
        "redis backend requires the 'redis' feature".into(),
    ))
}
