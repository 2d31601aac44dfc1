//! Event enrichment: raw event → delivery-ready row.
//!
//! [`build_row`] is a pure transformation over a raw event, the tab's
//! correlation entry, and the session identifiers. A row is
//! self-contained: rendering or exporting one must never require a
//! second lookup. Missing optional inputs resolve to `None`; inputs the
//! pipeline does not understand yield no row at all (dropped, not an
//! error).
//!
//! The post-action state debouncer also lives here: it collapses bursts
//! of DOM-mutation noise into one representative row per tab per
//! debounce window.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::correlate::{CorrelationEntry, url_host, url_path};
use crate::event::{ActionPayload, RawEvent, SnapshotHandles};
use crate::session::SessionIdentity;

/// Maximum stored length of an element uid.
const ELEMENT_UID_MAX_LEN: usize = 256;
/// Maximum stored length of the freeform data field.
const DATA_MAX_LEN: usize = 1_000;
/// Menu item candidates longer than this are considered prose, not
/// menu entries.
const MENU_ITEM_MAX_LEN: usize = 40;

/// Navigation/control keys that may appear on a row. Literal character
/// keys never leave the page except through the explicit value-capture
/// path.
const ALLOWED_KEYS: &[&str] = &[
    "Enter",
    "Tab",
    "Escape",
    "Backspace",
    "Delete",
    "ArrowLeft",
    "ArrowRight",
    "ArrowUp",
    "ArrowDown",
    "Home",
    "End",
    "PageUp",
    "PageDown",
];

/// Name fragments that mark an input as sensitive.
const SENSITIVE_NAME_TERMS: &[&str] = &["pass", "pwd", "ssn", "credit", "주민", "비번"];

// ─── Row ─────────────────────────────────────────────────────────────

/// The enriched, self-contained, delivery-ready unit.
///
/// Append-only once built; never mutated after entering the durable
/// buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Row {
    // Correlated API fields (populated only on a page-host match).
    pub api_url: Option<String>,
    pub api_method: Option<String>,
    pub api_status: Option<i32>,
    pub api_path: Option<String>,
    pub api_host: Option<String>,
    pub api_latency_ms: Option<i64>,

    // Page context.
    pub url: Option<String>,
    pub url_host: Option<String>,
    pub url_path: Option<String>,
    pub page_title: Option<String>,
    pub referrer: Option<String>,
    pub viewport_w: Option<u32>,
    pub viewport_h: Option<u32>,

    // Who and when.
    pub login_id: Option<String>,
    /// UTC wall-clock time, `YYYY-MM-DD HH:MM:SS`.
    pub event_time: Option<String>,
    pub session_install_id: Option<String>,
    pub session_browser_id: Option<String>,
    pub session_tab_id: Option<i64>,
    pub session_page_id: Option<String>,

    // Element identity.
    pub element_uid: Option<String>,
    pub element_type: Option<String>,
    pub element_label: Option<String>,
    pub element_tag: Option<String>,
    pub selector_css: Option<String>,
    pub selector_xpath: Option<String>,
    pub frame_path: Option<String>,
    pub shadow_path: Option<String>,
    pub form_selector: Option<String>,
    pub form_name: Option<String>,
    pub form_action: Option<String>,
    pub a11y_role: Option<String>,
    pub aria_label: Option<String>,
    pub aria_labelledby: Option<String>,
    pub data_testid: Option<String>,
    pub locators_json: Option<String>,

    // Action.
    pub event_action: Option<String>,
    pub event_subtype: Option<String>,
    pub data: Option<String>,
    pub input_length: Option<usize>,
    pub is_sensitive: Option<bool>,
    pub key: Option<String>,
    pub key_mods: Option<String>,
    pub nav_root: Option<String>,
    pub menu_trail: Option<String>,
    pub menu_section: Option<String>,
    pub menu_item: Option<String>,
    pub post_hints: Option<String>,
    pub route_from: Option<String>,
    pub route_to: Option<String>,

    // Snapshot pass-through.
    pub dom_before: Option<String>,
    pub dom_after: Option<String>,
    pub api_response_body: Option<String>,
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Render epoch-ms as UTC `YYYY-MM-DD HH:MM:SS`.
#[must_use]
pub fn format_event_time(ts_ms: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|v| !v.is_empty())
}

/// Whether an input is sensitive by type or by name fragment.
#[must_use]
pub fn is_sensitive_input(input_type: Option<&str>, name: Option<&str>) -> bool {
    if input_type
        .map(str::to_lowercase)
        .is_some_and(|t| t == "password")
    {
        return true;
    }
    let name = name.map(str::to_lowercase).unwrap_or_default();
    SENSITIVE_NAME_TERMS.iter().any(|t| name.contains(t))
}

/// Filter a key name against the navigation/control allow-list.
#[must_use]
pub fn allowed_key(key: Option<&str>) -> Option<String> {
    key.filter(|k| ALLOWED_KEYS.contains(k))
        .map(ToString::to_string)
}

fn key_mods(ctrl: bool, alt: bool, shift: bool) -> Option<String> {
    let mut mods = Vec::new();
    if ctrl {
        mods.push("ctrl");
    }
    if alt {
        mods.push("alt");
    }
    if shift {
        mods.push("shift");
    }
    if mods.is_empty() {
        None
    } else {
        Some(mods.join("+"))
    }
}

// ─── Menu trail normalization ────────────────────────────────────────

/// Normalize a breadcrumb-like trail of ancestor labels into a
/// `(section, item)` pair.
///
/// The last trail entry is the section (the label when the trail is
/// empty). The item is the explicit label when it differs from the
/// section, is not a substring of it, and is short enough to be a menu
/// entry; with no label, the first such trail entry serves instead.
/// When section and item coincide only the section is kept. Malformed
/// trails (empty strings, whitespace) never panic.
#[must_use]
pub fn normalize_menu_trail(
    trail: &[String],
    label: Option<&str>,
) -> (Option<String>, Option<String>) {
    let cleaned: Vec<&str> = trail
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let label = non_empty(label);

    let Some(section) = cleaned.last().copied().or(label) else {
        return (None, None);
    };

    let eligible = |candidate: &str| {
        candidate != section
            && !section.contains(candidate)
            && candidate.chars().count() <= MENU_ITEM_MAX_LEN
    };

    let item = match label {
        Some(l) => eligible(l).then(|| l.to_string()),
        None => cleaned
            .iter()
            .take(cleaned.len().saturating_sub(1))
            .find(|c| eligible(c))
            .map(ToString::to_string),
    };

    (Some(section.to_string()), item)
}

// ─── Post-state debouncer ────────────────────────────────────────────

/// Watched fields of a post-action state signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFields {
    pub title: Option<String>,
    pub modal_text: Option<String>,
    pub alert_text: Option<String>,
}

/// Per-tab deduplication of post-action state signals.
///
/// A state is accepted when no previous state was recorded for the tab
/// or at least one watched field differs from the last accepted state,
/// and the debounce interval has elapsed since that acceptance.
#[derive(Debug)]
pub struct StateDebouncer {
    min_interval_ms: i64,
    last_by_tab: HashMap<i64, (i64, StateFields)>,
}

impl StateDebouncer {
    #[must_use]
    pub fn new(min_interval_ms: i64) -> Self {
        Self {
            min_interval_ms,
            last_by_tab: HashMap::new(),
        }
    }

    /// Decide whether this state signal is meaningful for the tab.
    /// Accepted states become the new reference point.
    pub fn accept(&mut self, tab_id: i64, fields: &StateFields, now_ms: i64) -> bool {
        if let Some((last_ts, last_fields)) = self.last_by_tab.get(&tab_id) {
            if now_ms - last_ts < self.min_interval_ms {
                return false;
            }
            if last_fields == fields {
                return false;
            }
        }
        self.last_by_tab.insert(tab_id, (now_ms, fields.clone()));
        true
    }

    /// Drop all state for a closed tab.
    pub fn evict_tab(&mut self, tab_id: i64) {
        self.last_by_tab.remove(&tab_id);
    }
}

// ─── Row building ────────────────────────────────────────────────────

fn base_row(ev: &RawEvent, session: &SessionIdentity, login_id: &str) -> Row {
    let target = &ev.target;
    let uid = target
        .identifier
        .as_deref()
        .or(target.css.as_deref())
        .or(target.xpath.as_deref())
        .map(|s| truncate_chars(s, ELEMENT_UID_MAX_LEN));

    let locators = serde_json::json!({
        "a11y": target.a11y,
        "testids": target.testids,
        "attrs": target.attributes,
        "bounds": target.bounds,
        "session": session,
        "env": ev.env,
    });

    Row {
        url: Some(ev.source_url.clone()),
        url_host: url_host(&ev.source_url),
        url_path: url_path(&ev.source_url),
        login_id: Some(login_id.to_string()),
        event_time: format_event_time(ev.timestamp),
        session_install_id: session.install_id.clone(),
        session_browser_id: session.browser_session_id.clone(),
        session_tab_id: session.tab_id,
        session_page_id: session.page_session_id.clone(),
        element_uid: uid,
        element_tag: target.tag_name.as_deref().map(str::to_uppercase),
        selector_css: target.css.clone(),
        selector_xpath: target.xpath.clone(),
        frame_path: serde_json::to_string(&target.frame_path).ok(),
        shadow_path: serde_json::to_string(&target.shadow_path).ok(),
        form_selector: target.form.as_ref().and_then(|f| f.selector.clone()),
        form_name: target.form.as_ref().and_then(|f| f.name.clone()),
        form_action: target.form.as_ref().and_then(|f| f.action.clone()),
        a11y_role: target.a11y.role.clone(),
        aria_label: target.a11y.aria_label.clone(),
        aria_labelledby: target.a11y.aria_labelledby.clone(),
        data_testid: pick_testid(&target.testids),
        locators_json: serde_json::to_string(&locators).ok(),
        event_action: Some(ev.kind().as_str().to_string()),
        ..Row::default()
    }
}

fn pick_testid(testids: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    for key in ["data-testid", "data-test-id", "data-qa", "data-cy"] {
        if let Some(v) = testids.get(key).and_then(serde_json::Value::as_str) {
            return Some(v.to_string());
        }
    }
    None
}

fn apply_snapshot(row: &mut Row, snapshot: Option<&SnapshotHandles>) {
    if let Some(snap) = snapshot {
        row.dom_before = snap.dom_before.clone();
        row.dom_after = snap.dom_after.clone();
        row.api_response_body = snap.api_response_body.clone();
    }
}

fn apply_api(row: &mut Row, api: Option<&CorrelationEntry>, page_url: &str) {
    if let Some(entry) = api {
        let attach = entry.attach(page_url);
        row.api_url = attach.api_url;
        row.api_method = attach.api_method;
        row.api_status = attach.api_status;
        row.api_path = attach.api_path;
        row.api_host = attach.api_host;
        row.api_latency_ms = attach.api_latency_ms;
    }
}

/// Build a delivery-ready row from a raw event.
///
/// `api` is the tab's correlation entry at enrichment time; `session`
/// the identifiers for the originating page; `login_id` the current
/// login guess (`"unknown"` when none). Returns `None` for inputs the
/// pipeline does not turn into rows.
#[must_use]
pub fn build_row(
    ev: &RawEvent,
    api: Option<&CorrelationEntry>,
    session: &SessionIdentity,
    login_id: &str,
) -> Option<Row> {
    let mut row = base_row(ev, session, login_id);
    apply_api(&mut row, api, &ev.source_url);

    match &ev.payload {
        ActionPayload::InputChange {
            value,
            input_type,
            raw_len,
            selected_text,
            snapshot,
        } => {
            let sensitive = is_sensitive_input(
                input_type
                    .as_deref()
                    .or(ev.target.attributes.input_type.as_deref()),
                ev.target.attributes.name.as_deref(),
            );
            row.element_type = non_empty(input_type.as_deref())
                .map(|t| truncate_chars(&t.to_lowercase(), 32))
                .or_else(|| ev.target.tag_name.as_deref().map(str::to_lowercase));
            row.element_label = ev.target.label.clone();
            row.data = value
                .clone()
                .or_else(|| selected_text.clone())
                .map(|v| truncate_chars(&v, DATA_MAX_LEN));
            row.input_length =
                (*raw_len).or_else(|| value.as_deref().map(|v| v.chars().count()));
            row.is_sensitive = Some(sensitive);
            apply_snapshot(&mut row, snapshot.as_ref());
        }

        ActionPayload::Click { snapshot } => {
            row.element_type = Some("event".to_string());
            row.event_subtype = Some("click".to_string());
            row.element_label = ev.target.label.clone();
            apply_snapshot(&mut row, snapshot.as_ref());
        }

        ActionPayload::MenuClick {
            label,
            href,
            role,
            trail,
            nav_root,
            title,
            referrer,
            snapshot,
        } => {
            let (section, item) = normalize_menu_trail(trail, label.as_deref());
            let mut parts = Vec::new();
            if let Some(h) = non_empty(href.as_deref()) {
                parts.push(format!("href={h}"));
            }
            if !trail.is_empty() {
                parts.push(format!("trail={}", trail.join(" > ")));
            }
            if let Some(r) = non_empty(role.as_deref()) {
                parts.push(format!("role={r}"));
            }
            row.element_type = Some("menu".to_string());
            row.element_label = label.clone();
            row.data = (!parts.is_empty())
                .then(|| truncate_chars(&parts.join(" | "), DATA_MAX_LEN));
            row.nav_root = nav_root.clone();
            row.menu_trail = (!trail.is_empty())
                .then(|| serde_json::to_string(trail).ok())
                .flatten();
            row.menu_section = section;
            row.menu_item = item;
            row.page_title = title.clone();
            row.referrer = referrer.clone();
            apply_snapshot(&mut row, snapshot.as_ref());
        }

        ActionPayload::RouteChange { from, to, title } => {
            row.element_uid = Some("ROUTE".to_string());
            row.element_type = Some("route".to_string());
            row.event_subtype = Some("spa".to_string());
            row.page_title = title.clone();
            row.route_from = from.clone();
            row.route_to = to.clone();
        }

        ActionPayload::PageView {
            title,
            referrer,
            viewport,
        } => {
            row.element_uid = Some("PAGE".to_string());
            row.element_type = Some("page".to_string());
            row.page_title = title.clone();
            row.referrer = referrer.clone();
            row.viewport_w = viewport.as_ref().map(|v| v.w);
            row.viewport_h = viewport.as_ref().map(|v| v.h);
        }

        ActionPayload::FormSubmit { snapshot } => {
            row.element_type = Some("event".to_string());
            row.event_subtype = Some("submit".to_string());
            apply_snapshot(&mut row, snapshot.as_ref());
        }

        ActionPayload::GenericInstant {
            subtype,
            key,
            ctrl,
            alt,
            shift,
            length,
            button,
            x,
            y,
            sensitive,
        } => {
            row.element_type = Some("event".to_string());
            row.event_subtype = Some(subtype.clone());
            if matches!(subtype.as_str(), "keydown" | "keyup") && !sensitive {
                row.key = allowed_key(key.as_deref());
                row.key_mods = key_mods(*ctrl, *alt, *shift);
            }
            if subtype == "input" {
                row.input_length = *length;
            }
            let instant = serde_json::json!({
                "type": subtype,
                "key": row.key,
                "length": length,
                "button": button,
                "x": x,
                "y": y,
                "sensitive": sensitive,
            });
            row.data = Some(instant.to_string());
        }

        ActionPayload::PostState {
            title,
            modal_text,
            alert_text,
        } => {
            row.element_uid = Some("STATE".to_string());
            row.element_type = Some("state".to_string());
            row.page_title = title.clone();
            row.post_hints = serde_json::to_string(&serde_json::json!({
                "title": title,
                "modal_text": modal_text,
                "alert_text": alert_text,
            }))
            .ok();
        }
    }

    Some(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AttributeBundle, TargetDescriptor, Viewport};

    fn session() -> SessionIdentity {
        SessionIdentity {
            install_id: Some("inst-1".to_string()),
            browser_session_id: Some("bs-1".to_string()),
            tab_id: Some(7),
            page_session_id: Some("ps-1".to_string()),
        }
    }

    fn event(payload: ActionPayload) -> RawEvent {
        RawEvent {
            source_url: "https://a.com/orders?tab=open".to_string(),
            timestamp: 1_700_000_000_000,
            target: TargetDescriptor {
                css: Some("#field".to_string()),
                xpath: Some("/html/body/input[1]".to_string()),
                tag_name: Some("input".to_string()),
                identifier: Some("#field".to_string()),
                label: Some("Quantity".to_string()),
                ..TargetDescriptor::default()
            },
            payload,
            session: session(),
            env: None,
        }
    }

    fn api_entry(url: &str) -> CorrelationEntry {
        CorrelationEntry {
            url: url.to_string(),
            method: "POST".to_string(),
            status: Some(201),
            start_ts: 0,
            end_ts: Some(80),
            latency_ms: Some(80),
        }
    }

    // ── menu trail normalization ──

    #[test]
    fn menu_trail_last_entry_is_section() {
        let trail: Vec<String> = ["Reports", "Sales", "Monthly"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let (section, item) = normalize_menu_trail(&trail, Some("Monthly"));
        assert_eq!(section.as_deref(), Some("Monthly"));
        assert_eq!(item, None);
    }

    #[test]
    fn menu_trail_empty_uses_label() {
        let (section, item) = normalize_menu_trail(&[], Some("Settings"));
        assert_eq!(section.as_deref(), Some("Settings"));
        assert_eq!(item, None);
    }

    #[test]
    fn menu_trail_single_entry_keeps_differing_label() {
        let trail = vec!["Administration".to_string()];
        let (section, item) = normalize_menu_trail(&trail, Some("Users"));
        assert_eq!(section.as_deref(), Some("Administration"));
        assert_eq!(item.as_deref(), Some("Users"));
    }

    #[test]
    fn menu_trail_substring_label_is_dropped() {
        let trail = vec!["User Management".to_string()];
        let (section, item) = normalize_menu_trail(&trail, Some("User"));
        assert_eq!(section.as_deref(), Some("User Management"));
        assert_eq!(item, None);
    }

    #[test]
    fn menu_trail_without_label_picks_first_short_entry() {
        let trail: Vec<String> = ["Reports", "Quarterly"].iter().map(ToString::to_string).collect();
        let (section, item) = normalize_menu_trail(&trail, None);
        assert_eq!(section.as_deref(), Some("Quarterly"));
        assert_eq!(item.as_deref(), Some("Reports"));
    }

    #[test]
    fn menu_trail_long_candidates_are_prose() {
        let prose = "This quarter saw a significant uplift in order volume".to_string();
        let trail = vec![prose, "Orders".to_string()];
        let (section, item) = normalize_menu_trail(&trail, None);
        assert_eq!(section.as_deref(), Some("Orders"));
        assert_eq!(item, None);
    }

    #[test]
    fn menu_trail_malformed_never_panics() {
        let trail = vec![String::new(), "  ".to_string()];
        assert_eq!(normalize_menu_trail(&trail, None), (None, None));
        assert_eq!(
            normalize_menu_trail(&trail, Some("Home")),
            (Some("Home".to_string()), None)
        );
    }

    // ── state debouncer ──

    fn state(title: &str) -> StateFields {
        StateFields {
            title: Some(title.to_string()),
            ..StateFields::default()
        }
    }

    #[test]
    fn first_state_for_tab_is_accepted() {
        let mut d = StateDebouncer::new(600);
        assert!(d.accept(1, &state("Dashboard"), 1_000));
    }

    #[test]
    fn unchanged_state_is_rejected() {
        let mut d = StateDebouncer::new(600);
        assert!(d.accept(1, &state("Dashboard"), 1_000));
        assert!(!d.accept(1, &state("Dashboard"), 5_000));
    }

    #[test]
    fn changed_state_within_window_is_rejected() {
        let mut d = StateDebouncer::new(600);
        assert!(d.accept(1, &state("Dashboard"), 1_000));
        assert!(!d.accept(1, &state("Saved!"), 1_300));
        // Once the window passes, the change is accepted.
        assert!(d.accept(1, &state("Saved!"), 1_700));
    }

    #[test]
    fn tabs_debounce_independently() {
        let mut d = StateDebouncer::new(600);
        assert!(d.accept(1, &state("A"), 1_000));
        assert!(d.accept(2, &state("A"), 1_001));
        d.evict_tab(1);
        assert!(d.accept(1, &state("A"), 1_002));
    }

    #[test]
    fn any_watched_field_counts_as_change() {
        let mut d = StateDebouncer::new(100);
        assert!(d.accept(1, &state("Same"), 1_000));
        let with_alert = StateFields {
            title: Some("Same".to_string()),
            alert_text: Some("Error: quantity required".to_string()),
            ..StateFields::default()
        };
        assert!(d.accept(1, &with_alert, 2_000));
    }

    // ── row building ──

    #[test]
    fn input_change_row() {
        let mut ev = event(ActionPayload::InputChange {
            value: Some("ab***@e***".to_string()),
            input_type: Some("email".to_string()),
            raw_len: Some(15),
            selected_text: None,
            snapshot: None,
        });
        ev.target.attributes = AttributeBundle {
            input_type: Some("email".to_string()),
            name: Some("user_email".to_string()),
            ..AttributeBundle::default()
        };

        let row = build_row(&ev, None, &session(), "kim").unwrap();
        assert_eq!(row.event_action.as_deref(), Some("input_change"));
        assert_eq!(row.element_type.as_deref(), Some("email"));
        assert_eq!(row.data.as_deref(), Some("ab***@e***"));
        assert_eq!(row.input_length, Some(15));
        assert_eq!(row.is_sensitive, Some(false));
        assert_eq!(row.login_id.as_deref(), Some("kim"));
        assert_eq!(row.event_time.as_deref(), Some("2023-11-14 22:13:20"));
        assert_eq!(row.url_host.as_deref(), Some("a.com"));
        assert_eq!(row.url_path.as_deref(), Some("/orders"));
    }

    #[test]
    fn password_inputs_are_sensitive() {
        let ev = event(ActionPayload::InputChange {
            value: Some("*****".to_string()),
            input_type: Some("password".to_string()),
            raw_len: Some(12),
            selected_text: None,
            snapshot: None,
        });
        let row = build_row(&ev, None, &session(), "unknown").unwrap();
        assert_eq!(row.is_sensitive, Some(true));
    }

    #[test]
    fn same_host_api_fields_attach() {
        let ev = event(ActionPayload::Click { snapshot: None });
        let api = api_entry("https://a.com/api/orders");
        let row = build_row(&ev, Some(&api), &session(), "unknown").unwrap();
        assert_eq!(row.api_url.as_deref(), Some("https://a.com/api/orders"));
        assert_eq!(row.api_status, Some(201));
        assert_eq!(row.api_latency_ms, Some(80));
    }

    #[test]
    fn cross_host_api_fields_stay_empty() {
        let ev = event(ActionPayload::Click { snapshot: None });
        let api = api_entry("https://b.com/beacon");
        let row = build_row(&ev, Some(&api), &session(), "unknown").unwrap();
        assert_eq!(row.api_url, None);
        assert_eq!(row.api_method, None);
        assert_eq!(row.api_status, None);
        assert_eq!(row.api_latency_ms, None);
    }

    #[test]
    fn page_view_row() {
        let ev = event(ActionPayload::PageView {
            title: Some("Orders".to_string()),
            referrer: Some("https://a.com/login".to_string()),
            viewport: Some(Viewport { w: 1440, h: 900 }),
        });
        let row = build_row(&ev, None, &session(), "unknown").unwrap();
        assert_eq!(row.element_uid.as_deref(), Some("PAGE"));
        assert_eq!(row.element_type.as_deref(), Some("page"));
        assert_eq!(row.viewport_w, Some(1440));
        assert_eq!(row.viewport_h, Some(900));
    }

    #[test]
    fn route_change_row() {
        let ev = event(ActionPayload::RouteChange {
            from: Some("https://a.com/orders".to_string()),
            to: Some("https://a.com/orders/42".to_string()),
            title: Some("Order 42".to_string()),
        });
        let row = build_row(&ev, None, &session(), "unknown").unwrap();
        assert_eq!(row.element_uid.as_deref(), Some("ROUTE"));
        assert_eq!(row.event_subtype.as_deref(), Some("spa"));
        assert_eq!(row.route_from.as_deref(), Some("https://a.com/orders"));
        assert_eq!(row.route_to.as_deref(), Some("https://a.com/orders/42"));
    }

    #[test]
    fn menu_click_row() {
        let ev = event(ActionPayload::MenuClick {
            label: Some("Quarterly".to_string()),
            href: Some("/reports/q".to_string()),
            role: Some("menuitem".to_string()),
            trail: vec!["Reports".to_string()],
            nav_root: Some("nav.sidebar".to_string()),
            title: Some("Reports".to_string()),
            referrer: None,
            snapshot: None,
        });
        let row = build_row(&ev, None, &session(), "unknown").unwrap();
        assert_eq!(row.element_type.as_deref(), Some("menu"));
        assert_eq!(row.menu_section.as_deref(), Some("Reports"));
        assert_eq!(row.menu_item.as_deref(), Some("Quarterly"));
        let data = row.data.unwrap();
        assert!(data.contains("href=/reports/q"));
        assert!(data.contains("role=menuitem"));
        assert_eq!(row.menu_trail.as_deref(), Some("[\"Reports\"]"));
    }

    #[test]
    fn instant_key_row_filters_character_keys() {
        let mk = |key: &str| {
            event(ActionPayload::GenericInstant {
                subtype: "keydown".to_string(),
                key: Some(key.to_string()),
                ctrl: true,
                alt: false,
                shift: true,
                length: None,
                button: None,
                x: None,
                y: None,
                sensitive: false,
            })
        };
        let row = build_row(&mk("Enter"), None, &session(), "unknown").unwrap();
        assert_eq!(row.key.as_deref(), Some("Enter"));
        assert_eq!(row.key_mods.as_deref(), Some("ctrl+shift"));

        let row = build_row(&mk("a"), None, &session(), "unknown").unwrap();
        assert_eq!(row.key, None);
        assert_eq!(row.key_mods.as_deref(), Some("ctrl+shift"));
    }

    #[test]
    fn sensitive_instant_drops_key_and_mods() {
        let ev = event(ActionPayload::GenericInstant {
            subtype: "keydown".to_string(),
            key: Some("Enter".to_string()),
            ctrl: false,
            alt: false,
            shift: false,
            length: None,
            button: None,
            x: None,
            y: None,
            sensitive: true,
        });
        let row = build_row(&ev, None, &session(), "unknown").unwrap();
        assert_eq!(row.key, None);
        assert!(row.data.unwrap().contains("\"sensitive\":true"));
    }

    #[test]
    fn post_state_row_carries_hints() {
        let ev = event(ActionPayload::PostState {
            title: Some("Saved".to_string()),
            modal_text: None,
            alert_text: Some("Order saved".to_string()),
        });
        let row = build_row(&ev, None, &session(), "unknown").unwrap();
        assert_eq!(row.element_type.as_deref(), Some("state"));
        let hints = row.post_hints.unwrap();
        assert!(hints.contains("Order saved"));
    }

    #[test]
    fn build_row_is_deterministic() {
        let ev = event(ActionPayload::FormSubmit { snapshot: None });
        let api = api_entry("https://a.com/api/submit");
        let a = build_row(&ev, Some(&api), &session(), "kim").unwrap();
        let b = build_row(&ev, Some(&api), &session(), "kim").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn element_uid_is_truncated() {
        let mut ev = event(ActionPayload::Click { snapshot: None });
        ev.target.identifier = Some("x".repeat(1_000));
        let row = build_row(&ev, None, &session(), "unknown").unwrap();
        assert_eq!(row.element_uid.unwrap().len(), 256);
    }

    #[test]
    fn missing_target_fields_resolve_to_none() {
        let ev = RawEvent {
            source_url: "not a url".to_string(),
            timestamp: 0,
            target: TargetDescriptor::default(),
            payload: ActionPayload::Click { snapshot: None },
            session: SessionIdentity::default(),
            env: None,
        };
        let row = build_row(&ev, None, &SessionIdentity::default(), "unknown").unwrap();
        assert_eq!(row.element_uid, None);
        assert_eq!(row.url_host, None);
        assert_eq!(row.session_install_id, None);
    }
}
