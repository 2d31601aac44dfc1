//! Durable row buffer and upload queue.
//!
//! Every built row lands in both stores: the [`DurableBuffer`] is the
//! append-only record that survives delivery failures and feeds export;
//! the [`UploadQueue`] holds rows still awaiting delivery. The two are
//! deliberately decoupled so a failing endpoint never affects what an
//! export can see.
//!
//! Rows are shared by `Arc`; neither store clones row data.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::enrich::Row;

// ─── Durable buffer ──────────────────────────────────────────────────

/// Append-only in-memory record of every row built this lifetime.
///
/// Upload success or failure never removes anything; only an explicit
/// [`DurableBuffer::clear`] does.
#[derive(Debug, Default)]
pub struct DurableBuffer {
    rows: Vec<Arc<Row>>,
}

impl DurableBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, row: Arc<Row>) {
        self.rows.push(row);
    }

    /// All rows in append order.
    #[must_use]
    pub fn rows(&self) -> &[Arc<Row>] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ─── Upload queue ────────────────────────────────────────────────────

/// A row awaiting delivery, with its failed-attempt count.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub row: Arc<Row>,
    pub attempts: u32,
}

/// FIFO queue of rows pending upload.
///
/// A failed drain puts its rows back at the front so order is
/// preserved across retries. Rows whose attempt count reaches the
/// configured maximum move to the dead-letter list instead of being
/// requeued, where they stay inspectable; a maximum of zero retries
/// forever.
#[derive(Debug)]
pub struct UploadQueue {
    pending: VecDeque<PendingRow>,
    max_attempts: u32,
    dead_letter: Vec<PendingRow>,
}

impl UploadQueue {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            max_attempts,
            dead_letter: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Arc<Row>) {
        self.pending.push_back(PendingRow { row, attempts: 0 });
    }

    /// Take everything currently pending, in order.
    pub fn take_all(&mut self) -> Vec<PendingRow> {
        self.pending.drain(..).collect()
    }

    /// Put back rows from a failed delivery, bumping each attempt
    /// count. Rows that exhausted their attempts are parked in the
    /// dead-letter list. Returns how many were requeued.
    pub fn requeue_front(&mut self, batch: Vec<PendingRow>) -> usize {
        let mut kept = 0;
        let mut parked = Vec::new();
        for mut item in batch.into_iter().rev() {
            item.attempts += 1;
            if self.max_attempts > 0 && item.attempts >= self.max_attempts {
                parked.push(item);
                continue;
            }
            self.pending.push_front(item);
            kept += 1;
        }
        if !parked.is_empty() {
            tracing::warn!(rows = parked.len(), "rows dead-lettered after retries");
            parked.reverse();
            self.dead_letter.extend(parked);
        }
        kept
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Rows parked after exhausting their delivery attempts, in the
    /// order they were parked. They are never retried automatically;
    /// re-driving them is the operator's call.
    #[must_use]
    pub fn dead_letter(&self) -> &[PendingRow] {
        &self.dead_letter
    }

    /// Count of dead-lettered rows.
    #[must_use]
    pub fn dead_lettered(&self) -> usize {
        self.dead_letter.len()
    }
}
