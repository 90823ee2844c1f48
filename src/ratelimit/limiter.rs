//! Core fixed-window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::backend::CounterStore;
use super::counter::WindowHit;
use super::descriptor::IdentityKey;
use crate::error::{RatewallError, Result};

/// Default time allowed for one store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum requests allowed per window; zero or below disables limiting
    pub limit: i64,
    /// Length of the fixed window
    #[serde(default = "default_window", with = "crate::config::duration_format")]
    pub duration: Duration,
}

fn default_window() -> Duration {
    Duration::from_millis(1000)
}

impl LimitConfig {
    /// Create a new limit configuration.
    pub fn new(limit: i64, duration: Duration) -> Self {
        Self { limit, duration }
    }

    /// A configuration that never limits.
    pub fn unlimited() -> Self {
        Self {
            limit: -1,
            duration: default_window(),
        }
    }

    /// Whether this configuration actually limits anything.
    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Outcome of counting one request against its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// The configured limit
    pub total: i64,
    /// Requests left in the window; negative once the limit is exceeded
    pub remaining: i64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl RateDecision {
    /// Derive a decision from a store increment observed at `now`.
    pub fn from_hit(config: &LimitConfig, hit: WindowHit, now: DateTime<Utc>) -> Self {
        let count = i64::try_from(hit.count).unwrap_or(i64::MAX);
        let ttl = TimeDelta::from_std(hit.ttl).unwrap_or(TimeDelta::MAX);

        Self {
            total: config.limit,
            remaining: config.limit.saturating_sub(count),
            reset_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether the counted request pushed the window past its limit.
    pub fn is_exceeded(&self) -> bool {
        self.remaining < 0
    }

    /// Window end in whole seconds since the Unix epoch, rounded up.
    pub fn reset_epoch_secs(&self) -> i64 {
        let millis = self.reset_at.timestamp_millis();
        millis.div_euclid(1000) + i64::from(millis.rem_euclid(1000) > 0)
    }
}

/// The core rate limiter.
///
/// Each evaluation is exactly one atomic increment against the shared store.
/// The limiter holds no per-key state of its own and is cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    /// Shared counter store
    store: Arc<dyn CounterStore>,
    /// Upper bound for one store round trip
    timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a new rate limiter over `store`.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound each store round trip by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Count one request for `key` against `config`.
    ///
    /// Admission is left to the caller: the returned decision reports a
    /// negative `remaining` once the limit is exceeded. Store failures and
    /// timeouts surface as [`RatewallError::StoreUnavailable`].
    pub async fn evaluate(&self, key: &IdentityKey, config: &LimitConfig) -> Result<RateDecision> {
        if !config.is_limited() {
            return Err(RatewallError::InvalidConfig(format!(
                "cannot evaluate unlimited config (limit {}) for {}",
                config.limit, key
            )));
        }

        let store_key = key.to_string_key();

        trace!(
            key = %store_key,
            limit = config.limit,
            duration_ms = config.duration.as_millis() as u64,
            "Checking rate limit"
        );

        let hit = tokio::time::timeout(
            self.timeout,
            self.store.incr_with_expiry(&store_key, config.duration),
        )
        .await
        .map_err(|_| {
            RatewallError::StoreUnavailable(format!(
                "no answer within {}ms",
                self.timeout.as_millis()
            ))
        })??;

        let decision = RateDecision::from_hit(config, hit, Utc::now());

        if decision.is_exceeded() {
            debug!(
                key = %store_key,
                count = hit.count,
                limit = config.limit,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }
}
