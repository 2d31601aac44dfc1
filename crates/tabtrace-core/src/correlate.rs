//! Per-tab request correlation table.
//!
//! Tracks the most recent outbound network request per tab so that
//! enrichment can attach API fields (url/method/status/latency) to the
//! user action that most plausibly caused it. Two independent
//! observation points feed the table: request-start and
//! request-end/request-error.
//!
//! Last-request-wins: one entry per tab, overwritten by each new
//! request observation, no history. Known imprecision, accepted by
//! design: an event flushed late can attach a request that superseded
//! the one actually in flight when the event happened.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel status for a request that failed at the transport level.
pub const STATUS_TRANSPORT_ERROR: i32 = -1;

// ─── Request kinds ───────────────────────────────────────────────────

/// Network request type as reported by the host observation hooks.
///
/// Only page-driven kinds are correlated; subresource loads (images,
/// stylesheets, fonts) would produce false correlations and are
/// excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Xhr,
    Fetch,
    Beacon,
    Ping,
    MainFrame,
    Subresource,
}

impl RequestKind {
    /// Whether this kind participates in correlation.
    #[must_use]
    pub const fn is_observed(self) -> bool {
        !matches!(self, Self::Subresource)
    }

    /// Parse a host-reported type string. Unknown types map to
    /// `Subresource` and are ignored.
    #[must_use]
    pub fn from_host_type(s: &str) -> Self {
        match s {
            "xmlhttprequest" | "xhr" => Self::Xhr,
            "fetch" => Self::Fetch,
            "beacon" => Self::Beacon,
            "ping" => Self::Ping,
            "main_frame" => Self::MainFrame,
            _ => Self::Subresource,
        }
    }
}

// ─── Correlation entry ───────────────────────────────────────────────

/// The most recent request observed for one tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationEntry {
    pub url: String,
    pub method: String,
    /// None until a response is observed; [`STATUS_TRANSPORT_ERROR`]
    /// when the request failed at the transport level.
    pub status: Option<i32>,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
    pub latency_ms: Option<i64>,
}

/// API fields attached to a row when the correlated request's host
/// matches the event's page host. All-None otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiAttachment {
    pub api_url: Option<String>,
    pub api_method: Option<String>,
    pub api_status: Option<i32>,
    pub api_path: Option<String>,
    pub api_host: Option<String>,
    pub api_latency_ms: Option<i64>,
}

impl CorrelationEntry {
    /// Compute the attachment for an event on `page_url`.
    ///
    /// Cross-origin requests (CDNs, analytics beacons) must not be
    /// misattributed to a user-facing action, so every field is gated
    /// on the host match.
    #[must_use]
    pub fn attach(&self, page_url: &str) -> ApiAttachment {
        if !same_host(&self.url, page_url) {
            return ApiAttachment::default();
        }
        ApiAttachment {
            api_url: Some(self.url.clone()),
            api_method: Some(self.method.clone()),
            api_status: self.status,
            api_path: url_path(&self.url),
            api_host: url_host(&self.url),
            api_latency_ms: self.latency_ms,
        }
    }
}

// ─── URL helpers ─────────────────────────────────────────────────────

/// Host (including any explicit port) of a URL, None if unparseable.
#[must_use]
pub fn url_host(u: &str) -> Option<String> {
    let parsed = url::Url::parse(u).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Path of a URL, None if unparseable.
#[must_use]
pub fn url_path(u: &str) -> Option<String> {
    url::Url::parse(u).ok().map(|p| p.path().to_string())
}

/// Whether two URLs share a host. A parse failure on either side
/// counts as a match; partial correlation beats dropped correlation
/// for relative or exotic URLs.
#[must_use]
pub fn same_host(a: &str, b: &str) -> bool {
    match (url_host(a), url_host(b)) {
        (Some(ha), Some(hb)) => ha == hb,
        _ => true,
    }
}

// ─── Correlation table ───────────────────────────────────────────────

/// Per-tab map of the most recent outbound request.
///
/// Entries are created on request-start, mutated in place on
/// completion/error, and removed only by [`CorrelationTable::evict_tab`].
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<i64, CorrelationEntry>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a starting request. Returns true when the kind is
    /// observed and the caller should emit a flush request toward the
    /// tab's producer.
    pub fn on_request_start(
        &mut self,
        tab_id: i64,
        kind: RequestKind,
        url: &str,
        method: &str,
        ts: i64,
    ) -> bool {
        if !kind.is_observed() {
            return false;
        }
        self.entries.insert(
            tab_id,
            CorrelationEntry {
                url: url.to_string(),
                method: method.to_string(),
                status: None,
                start_ts: ts,
                end_ts: None,
                latency_ms: None,
            },
        );
        true
    }

    /// Record a completed request.
    ///
    /// The latency pairs this end against whatever start is present in
    /// the entry at write time; if no entry exists (end observed
    /// without a start) one is created with `start_ts = ts`.
    pub fn on_request_end(
        &mut self,
        tab_id: i64,
        url: &str,
        method: &str,
        status: i32,
        ts: i64,
    ) {
        let start_ts = self.entries.get(&tab_id).map_or(ts, |e| e.start_ts);
        self.entries.insert(
            tab_id,
            CorrelationEntry {
                url: url.to_string(),
                method: method.to_string(),
                status: Some(status),
                start_ts,
                end_ts: Some(ts),
                latency_ms: Some(ts.saturating_sub(start_ts).max(0)),
            },
        );
    }

    /// Record a transport-level failure; identical to
    /// [`Self::on_request_end`] with the sentinel status.
    pub fn on_request_error(&mut self, tab_id: i64, url: &str, method: &str, ts: i64) {
        self.on_request_end(tab_id, url, method, STATUS_TRANSPORT_ERROR, ts);
    }

    #[must_use]
    pub fn get(&self, tab_id: i64) -> Option<&CorrelationEntry> {
        self.entries.get(&tab_id)
    }

    /// Drop all state for a closed tab.
    pub fn evict_tab(&mut self, tab_id: i64) {
        self.entries.remove(&tab_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
