//! Page-scoped event batching.
//!
//! The batcher holds the ordered queue of raw events for one page
//! context and decides *when* a batch leaves, not where it goes: every
//! drain returns an [`EventBatch`] tagged with its [`FlushReason`] and
//! the caller hands it to the transport. The producer never blocks on
//! delivery and never retries; once a batch is handed over, reliability
//! is the consumer's concern.

use serde::{Deserialize, Serialize};

use crate::event::RawEvent;

// ─── Flush reasons ───────────────────────────────────────────────────

/// Why a batch was flushed. Serialized as the wire reason string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum FlushReason {
    /// Periodic timer fired.
    Interval,
    /// Queue reached its maximum length.
    Max,
    /// Page is unloading.
    Pagehide,
    /// Page visibility became hidden.
    Hidden,
    /// The consumer asked for an out-of-band flush (a network request
    /// is starting for this tab).
    Request,
    /// A specific UI action sent its events directly.
    Action(String),
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Interval => "interval",
            Self::Max => "max",
            Self::Pagehide => "pagehide",
            Self::Hidden => "hidden",
            Self::Request => "request",
            Self::Action(name) => name,
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FlushReason> for String {
    fn from(reason: FlushReason) -> Self {
        reason.as_str().to_string()
    }
}

impl From<String> for FlushReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "interval" => Self::Interval,
            "max" => Self::Max,
            "pagehide" => Self::Pagehide,
            "hidden" => Self::Hidden,
            "request" => Self::Request,
            _ => Self::Action(s),
        }
    }
}

/// An atomically drained batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub reason: FlushReason,
    pub events: Vec<RawEvent>,
}

// ─── Batcher ─────────────────────────────────────────────────────────

/// Bounded, ordered queue of raw events for the current page context.
#[derive(Debug)]
pub struct EventBatcher {
    queue: Vec<RawEvent>,
    max_queue: usize,
}

impl EventBatcher {
    #[must_use]
    pub fn new(max_queue: usize) -> Self {
        Self {
            queue: Vec::new(),
            max_queue: max_queue.max(1),
        }
    }

    /// Append an event. Returns `Some(batch)` when the push filled the
    /// queue to its maximum, in which case the queue was drained with
    /// reason [`FlushReason::Max`].
    pub fn push(&mut self, event: RawEvent) -> Option<EventBatch> {
        self.queue.push(event);
        if self.queue.len() >= self.max_queue {
            self.flush(FlushReason::Max)
        } else {
            None
        }
    }

    /// Drain the entire queue into one batch. Flushing an empty queue
    /// is a no-op and returns `None`.
    pub fn flush(&mut self, reason: FlushReason) -> Option<EventBatch> {
        if self.queue.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.queue);
        Some(EventBatch { reason, events })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
