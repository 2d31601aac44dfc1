//! CSV export of the durable buffer.
//!
//! The column set and order are fixed per schema version; a consumer
//! of exported files can rely on position. Every value is rendered
//! from the row itself, so export never consults live pipeline state.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::enrich::Row;
use crate::error::Result;

/// Bumped whenever a column is added, removed, or reordered.
pub const CSV_SCHEMA_VERSION: &str = "v1";

/// UTF-8 byte order mark, prepended so spreadsheet tools pick the
/// right encoding for non-ASCII values.
const BOM: &str = "\u{feff}";

/// Placeholder first cell written when the buffer is empty, so an
/// export is never a bare header that looks like a failed run.
const EMPTY_NOTICE: &str = "no rows captured";

/// Column order of schema v1. Must stay in lockstep with
/// [`row_fields`].
pub const CSV_COLUMNS: &[&str] = &[
    "api_url",
    "api_method",
    "api_status",
    "api_path",
    "api_host",
    "api_latency_ms",
    "url",
    "url_host",
    "url_path",
    "page_title",
    "referrer",
    "viewport_w",
    "viewport_h",
    "login_id",
    "event_time",
    "session_install_id",
    "session_browser_id",
    "session_tab_id",
    "session_page_id",
    "element_uid",
    "element_type",
    "element_label",
    "element_tag",
    "selector_css",
    "selector_xpath",
    "frame_path",
    "shadow_path",
    "form_selector",
    "form_name",
    "form_action",
    "a11y_role",
    "aria_label",
    "aria_labelledby",
    "data_testid",
    "locators_json",
    "event_action",
    "event_subtype",
    "data",
    "input_length",
    "is_sensitive",
    "key",
    "key_mods",
    "nav_root",
    "menu_trail",
    "menu_section",
    "menu_item",
    "post_hints",
    "route_from",
    "route_to",
    "dom_before",
    "dom_after",
    "api_response_body",
];

// ─── Field rendering ─────────────────────────────────────────────────

fn s(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

fn num<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

fn flag(v: Option<bool>) -> String {
    match v {
        Some(true) => "1".to_string(),
        Some(false) => "0".to_string(),
        None => String::new(),
    }
}

/// Row values in [`CSV_COLUMNS`] order.
#[must_use]
pub fn row_fields(row: &Row) -> Vec<String> {
    vec![
        s(&row.api_url),
        s(&row.api_method),
        num(row.api_status),
        s(&row.api_path),
        s(&row.api_host),
        num(row.api_latency_ms),
        s(&row.url),
        s(&row.url_host),
        s(&row.url_path),
        s(&row.page_title),
        s(&row.referrer),
        num(row.viewport_w),
        num(row.viewport_h),
        s(&row.login_id),
        s(&row.event_time),
        s(&row.session_install_id),
        s(&row.session_browser_id),
        num(row.session_tab_id),
        s(&row.session_page_id),
        s(&row.element_uid),
        s(&row.element_type),
        s(&row.element_label),
        s(&row.element_tag),
        s(&row.selector_css),
        s(&row.selector_xpath),
        s(&row.frame_path),
        s(&row.shadow_path),
        s(&row.form_selector),
        s(&row.form_name),
        s(&row.form_action),
        s(&row.a11y_role),
        s(&row.aria_label),
        s(&row.aria_labelledby),
        s(&row.data_testid),
        s(&row.locators_json),
        s(&row.event_action),
        s(&row.event_subtype),
        s(&row.data),
        num(row.input_length),
        flag(row.is_sensitive),
        s(&row.key),
        s(&row.key_mods),
        s(&row.nav_root),
        s(&row.menu_trail),
        s(&row.menu_section),
        s(&row.menu_item),
        s(&row.post_hints),
        s(&row.route_from),
        s(&row.route_to),
        s(&row.dom_before),
        s(&row.dom_after),
        s(&row.api_response_body),
    ]
}

/// Quote a field when it contains a delimiter, quote, or line break;
/// embedded quotes are doubled.
#[must_use]
pub fn csv_escape(field: &str) -> Cow<'_, str> {
    if field.contains(['"', ',', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

// ─── Export ──────────────────────────────────────────────────────────

/// Render the full CSV document, BOM and header included.
#[must_use]
pub fn rows_to_csv(rows: &[Arc<Row>]) -> String {
    let mut out = String::new();
    out.push_str(BOM);
    out.push_str(&CSV_COLUMNS.join(","));
    out.push_str("\r\n");

    if rows.is_empty() {
        let mut notice = vec![String::new(); CSV_COLUMNS.len()];
        notice[0] = EMPTY_NOTICE.to_string();
        out.push_str(&csv_line(&notice));
        out.push_str("\r\n");
        return out;
    }

    for row in rows {
        out.push_str(&csv_line(&row_fields(row)));
        out.push_str("\r\n");
    }
    out
}

/// Export filename for a given wall-clock instant:
/// `tabtrace_rows_YYYYMMDD_HHMMSS.csv` (UTC).
#[must_use]
pub fn export_filename(now_ms: i64) -> String {
    let stamp = chrono::DateTime::from_timestamp_millis(now_ms)
        .map(|dt| dt.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| "00000000_000000".to_string());
    format!("tabtrace_rows_{stamp}.csv")
}

/// Write the buffer to a timestamped CSV file in `dir`. Returns the
/// path written.
pub fn write_export(dir: &Path, rows: &[Arc<Row>], now_ms: i64) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(export_filename(now_ms));
    std::fs::write(&path, rows_to_csv(rows))?;
    tracing::info!(path = %path.display(), rows = rows.len(), "exported csv");
    Ok(path)
}
