//! Raw event model and producer/consumer message envelopes.
//!
//! A [`RawEvent`] is what the capture layer hands to the batch queue.
//! The action-specific data rides in [`ActionPayload`], a tagged union
//! over the action kind, so enrichment dispatches on a variant instead
//! of null-checking a loose bag of optional fields.
//!
//! # Protocol
//!
//! Messages are JSON with an internal `type` tag:
//! - Producer sends: `{"type":"batch_events","reason":"interval","events":[...]}`
//!   or `{"type":"hello"}`
//! - Consumer sends: `{"type":"flush_request"}` (best-effort, no ack)
//! - Batch ack: `{"ok":true,"accepted":3}`; hello ack:
//!   `{"browser_session_id":"...","tab_id":7}`

use serde::{Deserialize, Serialize};

use crate::session::SessionIdentity;

// ─── Action payloads ─────────────────────────────────────────────────

/// Discriminant of a raw event's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    InputChange,
    Click,
    MenuClick,
    RouteChange,
    PageView,
    FormSubmit,
    GenericInstant,
    PostState,
}

impl ActionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InputChange => "input_change",
            Self::Click => "click",
            Self::MenuClick => "menu_click",
            Self::RouteChange => "route_change",
            Self::PageView => "page_view",
            Self::FormSubmit => "form_submit",
            Self::GenericInstant => "generic_instant",
            Self::PostState => "post_state",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque DOM snapshot handles captured around an action.
///
/// The pipeline never interprets these; they pass through to the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandles {
    pub dom_before: Option<String>,
    pub dom_after: Option<String>,
    pub api_response_body: Option<String>,
}

/// Viewport dimensions at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub w: u32,
    pub h: u32,
}

/// Action-specific event data, one variant per [`ActionKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    /// Final (committed) value of an input-like element. The value
    /// arrives already masked by the capture layer; `raw_len` is the
    /// unmasked length.
    InputChange {
        value: Option<String>,
        input_type: Option<String>,
        raw_len: Option<usize>,
        selected_text: Option<String>,
        snapshot: Option<SnapshotHandles>,
    },
    /// Plain element click outside any navigation structure.
    Click { snapshot: Option<SnapshotHandles> },
    /// Click on a navigation/menu entry, with the ancestor label trail.
    MenuClick {
        label: Option<String>,
        href: Option<String>,
        role: Option<String>,
        trail: Vec<String>,
        nav_root: Option<String>,
        title: Option<String>,
        referrer: Option<String>,
        snapshot: Option<SnapshotHandles>,
    },
    /// SPA navigation (history API wrap or popstate).
    RouteChange {
        from: Option<String>,
        to: Option<String>,
        title: Option<String>,
    },
    /// Initial page load.
    PageView {
        title: Option<String>,
        referrer: Option<String>,
        viewport: Option<Viewport>,
    },
    /// Form submission.
    FormSubmit { snapshot: Option<SnapshotHandles> },
    /// Lightweight instant signal (key/mouse/focus). Key names are
    /// filtered against the allow-list at enrichment, not here.
    GenericInstant {
        subtype: String,
        key: Option<String>,
        #[serde(default)]
        ctrl: bool,
        #[serde(default)]
        alt: bool,
        #[serde(default)]
        shift: bool,
        length: Option<usize>,
        button: Option<i32>,
        x: Option<i32>,
        y: Option<i32>,
        #[serde(default)]
        sensitive: bool,
    },
    /// Post-action page state (toast/modal/heading change). Deduplicated
    /// per tab by the consumer before a row is built.
    PostState {
        title: Option<String>,
        modal_text: Option<String>,
        alert_text: Option<String>,
    },
}

impl ActionPayload {
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::InputChange { .. } => ActionKind::InputChange,
            Self::Click { .. } => ActionKind::Click,
            Self::MenuClick { .. } => ActionKind::MenuClick,
            Self::RouteChange { .. } => ActionKind::RouteChange,
            Self::PageView { .. } => ActionKind::PageView,
            Self::FormSubmit { .. } => ActionKind::FormSubmit,
            Self::GenericInstant { .. } => ActionKind::GenericInstant,
            Self::PostState { .. } => ActionKind::PostState,
        }
    }
}

// ─── Target descriptor ───────────────────────────────────────────────

/// Selector/identifier bundle for the element an event targeted.
///
/// Selector generation happens in the capture layer; everything here is
/// opaque to the pipeline and optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetDescriptor {
    pub css: Option<String>,
    pub xpath: Option<String>,
    pub tag_name: Option<String>,
    /// First of id / name / data-testid / aria-label / href.
    pub identifier: Option<String>,
    pub label: Option<String>,
    pub attributes: AttributeBundle,
    pub a11y: A11yBundle,
    /// data-* attributes (test ids and friends).
    pub testids: serde_json::Map<String, serde_json::Value>,
    pub form: Option<FormContext>,
    pub frame_path: Vec<String>,
    pub shadow_path: Vec<String>,
    pub bounds: Option<Bounds>,
}

/// Common element attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeBundle {
    #[serde(rename = "type")]
    pub input_type: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
}

/// Accessibility metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct A11yBundle {
    pub role: Option<String>,
    pub aria_label: Option<String>,
    pub aria_labelledby: Option<String>,
}

/// Enclosing form, when any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormContext {
    pub selector: Option<String>,
    pub name: Option<String>,
    pub action: Option<String>,
}

/// Element bounding box (page coordinates, rounded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

// ─── Raw event ───────────────────────────────────────────────────────

/// A single captured interaction, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Page URL at capture time.
    pub source_url: String,
    /// Capture time, ms since epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub target: TargetDescriptor,
    pub payload: ActionPayload,
    /// Session identifiers stamped by the producer. All-None when the
    /// handshake never completed.
    #[serde(default)]
    pub session: SessionIdentity,
    /// Host environment metadata (user agent, locale, screen) collected
    /// by the capture layer; carried verbatim into the locators blob.
    #[serde(default)]
    pub env: Option<serde_json::Value>,
}

impl RawEvent {
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

// ─── Message envelopes ───────────────────────────────────────────────

/// Message from a page producer to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageMessage {
    /// A drained batch of raw events plus the reason it flushed.
    BatchEvents { reason: String, events: Vec<RawEvent> },
    /// Session handshake request, answered with [`HelloAck`].
    Hello,
}

/// Message from the consumer to a page producer (best-effort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// A network request is starting for this tab; flush causally
    /// preceding events now.
    FlushRequest,
}

/// Acknowledgment for a delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub ok: bool,
    /// Rows actually built and buffered from this batch.
    pub accepted: usize,
}

/// Answer to a [`PageMessage::Hello`] handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub browser_session_id: Option<String>,
    pub tab_id: Option<i64>,
}

/// Reply to a page message, when the producer asked for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageReply {
    Batch(BatchAck),
    Hello(HelloAck),
}
