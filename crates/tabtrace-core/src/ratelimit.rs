//! Producer-side admission control.
//!
//! Three independent gates sit in front of the batch queue:
//!
//! - [`RateLimiter`]: token bucket per (entity, signal kind), bounding
//!   burst volume.
//! - [`SamplingGate`]: minimum spacing between same-kind instant
//!   signals, bounding frequency. `keydown` is exempt so discrete key
//!   presses are never thinned.
//! - [`MenuDedup`]: per-entity spacing for menu clicks, collapsing the
//!   double events some widget libraries fire per activation.
//!
//! All gates take the current time as a parameter; nothing here reads
//! the clock, which keeps admission decisions deterministic under test.
//!
//! Entity state is keyed by [`EntityId`] handles issued by the producer
//! and must be released via `evict_entity` when the element detaches,
//! so the stores cannot outlive the DOM entities they track.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;

/// Arena-assigned handle for a DOM-entity-scoped state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

// ─── Token bucket ────────────────────────────────────────────────────

/// A single token bucket.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_ms: i64,
}

impl TokenBucket {
    const fn full(capacity: f64, now_ms: i64) -> Self {
        Self {
            tokens: capacity,
            last_ms: now_ms,
        }
    }

    /// Refill proportional to elapsed time, then admit iff a whole
    /// token is available.
    fn admit(&mut self, capacity: f64, rate_per_s: f64, now_ms: i64) -> bool {
        let elapsed_s = (now_ms.saturating_sub(self.last_ms)).max(0) as f64 / 1_000.0;
        self.tokens = (self.tokens + elapsed_s * rate_per_s).min(capacity);
        self.last_ms = now_ms;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket admission per (entity, signal kind).
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate_per_s: f64,
    buckets: HashMap<(EntityId, String), TokenBucket>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(capacity: u32, rate_per_s: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            rate_per_s,
            buckets: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.bucket_size, config.bucket_rate)
    }

    /// Decide whether a candidate signal is admitted. Dropped signals
    /// have no side effect beyond the token accounting itself.
    pub fn admit(&mut self, entity: EntityId, kind: &str, now_ms: i64) -> bool {
        let bucket = self
            .buckets
            .entry((entity, kind.to_string()))
            .or_insert_with(|| TokenBucket::full(self.capacity, now_ms));
        bucket.admit(self.capacity, self.rate_per_s, now_ms)
    }

    /// Release all state for a detached entity.
    pub fn evict_entity(&mut self, entity: EntityId) {
        self.buckets.retain(|(id, _), _| *id != entity);
    }

    /// Number of live bucket entries (for leak checks).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

// ─── Sampling gate ───────────────────────────────────────────────────

/// Minimum-spacing gate for instant signals, independent of the bucket.
#[derive(Debug)]
pub struct SamplingGate {
    min_interval_ms: i64,
    last_by_kind: HashMap<String, i64>,
}

impl SamplingGate {
    #[must_use]
    pub fn new(min_interval_ms: i64) -> Self {
        Self {
            min_interval_ms,
            last_by_kind: HashMap::new(),
        }
    }

    /// Admit iff at least the configured interval elapsed since the
    /// last admitted signal of the same kind. `keydown` always passes.
    pub fn admit(&mut self, kind: &str, now_ms: i64) -> bool {
        if kind == "keydown" {
            return true;
        }
        match self.last_by_kind.get(kind) {
            Some(last) if now_ms - last < self.min_interval_ms => false,
            _ => {
                self.last_by_kind.insert(kind.to_string(), now_ms);
                true
            }
        }
    }
}

// ─── Menu dedup ──────────────────────────────────────────────────────

/// Per-entity spacing gate for menu clicks.
#[derive(Debug)]
pub struct MenuDedup {
    window_ms: i64,
    last_by_entity: HashMap<EntityId, i64>,
}

impl MenuDedup {
    #[must_use]
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            last_by_entity: HashMap::new(),
        }
    }

    /// Admit iff more than the window elapsed since the last admitted
    /// click on this entity. The timestamp is updated on every call,
    /// admitted or not, so a rapid burst never re-opens the window.
    pub fn admit(&mut self, entity: EntityId, now_ms: i64) -> bool {
        let prev = self.last_by_entity.insert(entity, now_ms).unwrap_or(0);
        now_ms - prev > self.window_ms
    }

    pub fn evict_entity(&mut self, entity: EntityId) {
        self.last_by_entity.remove(&entity);
    }
}
