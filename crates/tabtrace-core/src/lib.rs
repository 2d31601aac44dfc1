//! Core library for tabtrace, a client-side interaction telemetry
//! pipeline.
//!
//! Captured DOM interactions flow through admission gates and a
//! page-scoped batch queue ([`pipeline::Producer`]), cross a message
//! channel to the per-process hub ([`pipeline::Consumer`]), get
//! enriched with per-tab network correlation and session identity into
//! flat [`enrich::Row`]s, and land in both a durable buffer (feeding
//! CSV export) and a retrying upload queue.
//!
//! The crate is transport-agnostic at the edges: capture hooks feed
//! events in, [`deliver::IngestTransport`] carries rows out, and every
//! time-dependent decision takes an explicit timestamp so behavior is
//! reproducible under test.

pub mod batcher;
pub mod buffer;
pub mod config;
pub mod correlate;
pub mod deliver;
pub mod enrich;
pub mod error;
pub mod event;
pub mod export;
pub mod pipeline;
pub mod ratelimit;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};

/// Crate version, for diagnostics and export metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
