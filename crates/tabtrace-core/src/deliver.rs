//! Row delivery to the ingest endpoint.
//!
//! The [`IngestTransport`] trait is the seam between queue mechanics
//! and the network. The production transport posts JSON over HTTP with
//! an `x-api-key` header; tests swap in a scripted mock. Delivery is
//! all-or-nothing per drain: a failed POST requeues every row of the
//! batch at the front, so nothing is lost and order is kept.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::buffer::{PendingRow, UploadQueue};
use crate::config::UploaderConfig;
use crate::enrich::Row;

// ─── Delivery result ─────────────────────────────────────────────────

/// Outcome of one transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryResult {
    #[must_use]
    pub const fn ok(status: u16) -> Self {
        Self {
            success: true,
            status: Some(status),
            error: None,
        }
    }

    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: None,
            error: Some(message.into()),
        }
    }

    #[must_use]
    pub fn http_err(status: u16) -> Self {
        Self {
            success: false,
            status: Some(status),
            error: Some(format!("http status {status}")),
        }
    }
}

// ─── Wire body ───────────────────────────────────────────────────────

/// POST body for one drain.
#[derive(Debug, Serialize)]
pub struct UploadBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
    pub rows: Vec<&'a Row>,
    /// Drain time, ms since epoch.
    pub ts: i64,
}

// ─── Transport ───────────────────────────────────────────────────────

/// Anything that can deliver a drained batch.
pub trait IngestTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        body: &'a UploadBody<'a>,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>>;
}

/// HTTP POST transport.
pub struct HttpIngestTransport {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpIngestTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }

    /// Build the transport from config; `None` when delivery is
    /// disabled.
    #[must_use]
    pub fn from_config(config: &UploaderConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.ingest_url.clone(), config.api_key.clone()))
    }
}

impl IngestTransport for HttpIngestTransport {
    fn send<'a>(
        &'a self,
        body: &'a UploadBody<'a>,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async move {
            let mut req = self.client.post(&self.url).json(body);
            if let Some(key) = &self.api_key {
                req = req.header("x-api-key", key);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if resp.status().is_success() {
                        DeliveryResult::ok(status)
                    } else {
                        DeliveryResult::http_err(status)
                    }
                }
                Err(e) => DeliveryResult::err(e.to_string()),
            }
        })
    }
}

/// Transport for disabled upload: accepts and discards everything.
pub struct NoopTransport;

impl IngestTransport for NoopTransport {
    fn send<'a>(
        &'a self,
        _body: &'a UploadBody<'a>,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async { DeliveryResult::ok(204) })
    }
}

// ─── Uploader ────────────────────────────────────────────────────────

/// What a drain attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing was pending.
    Empty,
    /// Another drain was already in flight.
    Busy,
    /// All pending rows delivered.
    Delivered(usize),
    /// Delivery failed; rows requeued (dead-lettered rows excluded).
    Requeued(usize),
}

/// Owns the upload queue and drains it through a transport.
///
/// At most one drain runs at a time; overlapping triggers (interval
/// tick, action flush, wake) collapse into the one in flight.
pub struct Uploader {
    queue: Mutex<UploadQueue>,
    transport: Box<dyn IngestTransport>,
    notify: tokio::sync::Notify,
    draining: AtomicBool,
    drain_interval: Duration,
    retry_delay: Duration,
}

impl Uploader {
    #[must_use]
    pub fn new(config: &UploaderConfig, transport: Box<dyn IngestTransport>) -> Self {
        Self {
            queue: Mutex::new(UploadQueue::new(config.max_attempts)),
            transport,
            notify: tokio::sync::Notify::new(),
            draining: AtomicBool::new(false),
            drain_interval: Duration::from_millis(config.drain_interval_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Queue a row for delivery and wake the drain loop.
    pub fn enqueue(&self, row: Arc<Row>) {
        self.queue.lock().expect("lock poisoned").push(row);
        self.notify.notify_one();
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("lock poisoned").len()
    }

    #[must_use]
    pub fn dead_lettered(&self) -> usize {
        self.queue.lock().expect("lock poisoned").dead_lettered()
    }

    /// Snapshot of the parked rows, for inspection or manual
    /// re-driving.
    #[must_use]
    pub fn dead_letter(&self) -> Vec<PendingRow> {
        self.queue.lock().expect("lock poisoned").dead_letter().to_vec()
    }

    /// Attempt to deliver everything currently pending.
    ///
    /// `reason` is forwarded on the wire for action-triggered drains;
    /// periodic drains pass `None`.
    pub async fn drain_once(&self, reason: Option<&str>, now_ms: i64) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return DrainOutcome::Busy;
        }
        let outcome = self.drain_inner(reason, now_ms).await;
        self.draining.store(false, Ordering::Release);
        outcome
    }

    async fn drain_inner(&self, reason: Option<&str>, now_ms: i64) -> DrainOutcome {
        let batch: Vec<PendingRow> = self.queue.lock().expect("lock poisoned").take_all();
        if batch.is_empty() {
            return DrainOutcome::Empty;
        }

        let rows: Vec<&Row> = batch.iter().map(|p| p.row.as_ref()).collect();
        let body = UploadBody {
            reason,
            rows,
            ts: now_ms,
        };
        let result = self.transport.send(&body).await;

        if result.success {
            tracing::debug!(rows = batch.len(), status = ?result.status, "batch delivered");
            DrainOutcome::Delivered(batch.len())
        } else {
            tracing::warn!(
                rows = batch.len(),
                status = ?result.status,
                error = result.error.as_deref().unwrap_or("unknown"),
                "delivery failed, requeueing"
            );
            let kept = self
                .queue
                .lock()
                .expect("lock poisoned")
                .requeue_front(batch);
            DrainOutcome::Requeued(kept)
        }
    }

    /// Periodic drain loop. Runs until `shutdown` flips true, then
    /// makes one final drain attempt.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.drain_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let now = chrono::Utc::now().timestamp_millis();
                        let _ = self.drain_once(None, now).await;
                        return;
                    }
                }
            }
            let now = chrono::Utc::now().timestamp_millis();
            if matches!(self.drain_once(None, now).await, DrainOutcome::Requeued(_)) {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
    }
}
