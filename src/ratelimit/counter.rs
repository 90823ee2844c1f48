//! Fixed-window counter state.

use std::time::Duration;
use tokio::time::Instant;

/// Result of one atomic increment against a counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// The count after this increment
    pub count: u64,
    /// Time left before the window expires
    pub ttl: Duration,
}

/// The live state of one counting window.
///
/// A window is created by the first increment for its key and carries a fixed
/// expiry from then on. Later increments never move the expiry.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    /// Requests counted in this window
    count: u64,
    /// When the window stops counting
    expires_at: Instant,
}

impl WindowCounter {
    /// Open a new, empty window that lasts `ttl` from `now`.
    pub fn new(now: Instant, ttl: Duration) -> Self {
        Self {
            count: 0,
            expires_at: now + ttl,
        }
    }

    /// Count one request.
    ///
    /// An expired window is replaced by a fresh one before counting, so the
    /// returned count restarts at 1 once the old window has elapsed.
    pub fn increment(&mut self, now: Instant, ttl: Duration) -> WindowHit {
        if self.is_expired(now) {
            *self = Self::new(now, ttl);
        }

        self.count += 1;
        WindowHit {
            count: self.count,
            ttl: self.ttl_remaining(now),
        }
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// The current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Time until the window expires, zero once it has.
    pub fn ttl_remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
