//! Pipeline configuration.
//!
//! One section per component, each with serde defaults that mirror the
//! constants the pipeline shipped with. A config file is optional; every
//! field falls back to its default when absent.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub batcher: BatcherConfig,
    pub correlation: CorrelationConfig,
    pub uploader: UploaderConfig,
    pub session: SessionConfig,
    pub export: ExportConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Producer-side capture limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Token bucket capacity per (entity, signal kind).
    pub bucket_size: u32,
    /// Token refill rate per second.
    pub bucket_rate: f64,
    /// Minimum spacing between same-kind instant signals (ms).
    pub key_sampling_ms: i64,
    /// Debounce before a pending input value is considered final (ms).
    pub final_debounce_ms: i64,
    /// Minimum spacing between admitted clicks on the same menu entity (ms).
    pub menu_dedup_ms: i64,
    /// Settle delay before the "after" snapshot is taken (ms). The
    /// snapshot itself is captured by the host; this is pass-through
    /// configuration for it.
    pub snapshot_after_delay_ms: i64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            bucket_rate: 10.0,
            key_sampling_ms: 120,
            final_debounce_ms: 600,
            menu_dedup_ms: 400,
            snapshot_after_delay_ms: 250,
        }
    }
}

/// Producer-side batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Queue length that triggers an immediate flush.
    pub max_queue: usize,
    /// Periodic flush interval (ms).
    pub flush_interval_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_queue: 40,
            flush_interval_ms: 5_000,
        }
    }
}

/// Consumer-side correlation and state dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Minimum spacing between accepted post-action state rows per tab (ms).
    pub state_debounce_ms: i64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            state_debounce_ms: 600,
        }
    }
}

/// Remote delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Enable remote delivery. When false rows only accumulate locally.
    pub enabled: bool,
    /// Collector endpoint for `POST { reason?, rows, ts }`.
    pub ingest_url: String,
    /// Optional shared secret sent as `x-api-key`.
    pub api_key: Option<String>,
    /// Drain wake-up interval (ms).
    pub drain_interval_ms: u64,
    /// Delay before retrying a failed batch (ms).
    pub retry_delay_ms: u64,
    /// Delivery attempts per row batch before parking it in the
    /// dead-letter list. 0 means retry forever (the original behavior).
    pub max_attempts: u32,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ingest_url: "http://127.0.0.1:8080/ingest/batch".to_string(),
            api_key: None,
            drain_interval_ms: 5_000,
            retry_delay_ms: 15_000,
            max_attempts: 10,
        }
    }
}

/// Session identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory for the identity state file.
    pub state_dir: Option<std::path::PathBuf>,
    /// Persist the browser session id across consumer restarts.
    pub persist_browser_session: bool,
    /// How long a producer waits for the hello handshake (ms).
    pub hello_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            persist_browser_session: false,
            hello_timeout_ms: 1_000,
        }
    }
}

/// Bulk CSV export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Output directory for export files.
    pub out_dir: std::path::PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: std::path::PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_constants() {
        let c = Config::default();
        assert_eq!(c.capture.bucket_size, 20);
        assert!((c.capture.bucket_rate - 10.0).abs() < f64::EPSILON);
        assert_eq!(c.capture.key_sampling_ms, 120);
        assert_eq!(c.capture.final_debounce_ms, 600);
        assert_eq!(c.batcher.max_queue, 40);
        assert_eq!(c.batcher.flush_interval_ms, 5_000);
        assert_eq!(c.correlation.state_debounce_ms, 600);
        assert_eq!(c.uploader.max_attempts, 10);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [capture]
            bucket_size = 5

            [uploader]
            ingest_url = "https://collector.example/ingest"
            api_key = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.capture.bucket_size, 5);
        assert_eq!(parsed.capture.key_sampling_ms, 120);
        assert_eq!(parsed.uploader.ingest_url, "https://collector.example/ingest");
        assert_eq!(parsed.uploader.api_key.as_deref(), Some("secret"));
        assert_eq!(parsed.uploader.retry_delay_ms, 15_000);
    }

    #[test]
    fn load_missing_file_is_config_read_error() {
        let err = Config::load(Path::new("/nonexistent/tabtrace.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn load_bad_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabtrace.toml");
        std::fs::write(&path, "capture = 3").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }
}
