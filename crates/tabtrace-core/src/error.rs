//! Error types for tabtrace-core.
//!
//! A single crate-wide error enum. Transient and host-unavailability
//! failures are logged and swallowed close to where they occur, so only
//! genuinely surfaced conditions (config parsing, export I/O, identity
//! persistence) live here.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// tabtrace-core error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Identity state could not be read or written.
    #[error("identity storage error at {path}: {message}")]
    Identity { path: PathBuf, message: String },

    /// CSV export failed.
    #[error("export failed: {0}")]
    Export(#[from] std::io::Error),

    /// Serialization failure (should not occur for well-formed rows).
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The consumer channel is closed; the pipeline is shut down.
    #[error("pipeline channel closed")]
    ChannelClosed,
}
