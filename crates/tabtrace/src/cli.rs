//! Command definitions and dispatch.
//!
//! The CLI is a harness around the library pipeline: `replay` pushes a
//! recorded event log through the full consumer path and exports the
//! resulting rows; `schema` prints the CSV column contract.
//!
//! # Replay input format
//!
//! One JSON object per line. Each line is either a captured event or a
//! network observation:
//!
//! ```text
//! {"tab_id":7,"event":{"source_url":"https://a.com/","timestamp":1700000000000,"payload":{"kind":"click"}}}
//! {"tab_id":7,"request_start":{"kind":"fetch","url":"https://a.com/api","method":"POST","ts":1700000000100}}
//! {"tab_id":7,"request_end":{"url":"https://a.com/api","method":"POST","status":201,"ts":1700000000180}}
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use tabtrace_core::config::Config;
use tabtrace_core::correlate::RequestKind;
use tabtrace_core::deliver::{HttpIngestTransport, IngestTransport, NoopTransport, Uploader};
use tabtrace_core::event::RawEvent;
use tabtrace_core::export;
use tabtrace_core::pipeline::Consumer;
use tabtrace_core::session::IdentityManager;

#[derive(Debug, Parser)]
#[command(name = "tabtrace", version, about = "Interaction telemetry pipeline tooling")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true, env = "TABTRACE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay a recorded event log through the pipeline and export
    /// the rows as CSV.
    Replay {
        /// JSONL event log, one record per line.
        input: PathBuf,
        /// Output directory for the CSV export.
        #[arg(long, default_value = "./out")]
        out: PathBuf,
        /// Also deliver rows to this ingest endpoint.
        #[arg(long, env = "TABTRACE_ENDPOINT")]
        endpoint: Option<String>,
        /// API key sent as x-api-key with deliveries.
        #[arg(long, env = "TABTRACE_API_KEY")]
        api_key: Option<String>,
    },
    /// Print the CSV export schema.
    Schema,
}

// ─── Replay records ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReplayLine {
    tab_id: i64,
    #[serde(default)]
    event: Option<RawEvent>,
    #[serde(default)]
    request_start: Option<RequestStartRecord>,
    #[serde(default)]
    request_end: Option<RequestEndRecord>,
    #[serde(default)]
    request_error: Option<RequestErrorRecord>,
}

#[derive(Debug, Deserialize)]
struct RequestStartRecord {
    kind: String,
    url: String,
    method: String,
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct RequestEndRecord {
    url: String,
    method: String,
    status: i32,
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct RequestErrorRecord {
    url: String,
    method: String,
    ts: i64,
}

// ─── Dispatch ────────────────────────────────────────────────────────

pub async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Replay {
            input,
            out,
            endpoint,
            api_key,
        } => replay(&config, &input, &out, endpoint, api_key).await,
        Commands::Schema => {
            println!("schema {}", export::CSV_SCHEMA_VERSION);
            for column in export::CSV_COLUMNS {
                println!("{column}");
            }
            Ok(())
        }
    }
}

async fn replay(
    config: &Config,
    input: &std::path::Path,
    out: &std::path::Path,
    endpoint: Option<String>,
    api_key: Option<String>,
) -> Result<()> {
    let state_dir = config
        .session
        .state_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let identity = IdentityManager::load_or_create(&state_dir, &config.session)?;

    let upload = endpoint.is_some();
    let transport: Box<dyn IngestTransport> = match endpoint {
        Some(url) => Box::new(HttpIngestTransport::new(url, api_key)),
        None => Box::new(NoopTransport),
    };
    let uploader = Arc::new(Uploader::new(&config.uploader, transport));
    let mut consumer = Consumer::new(config, identity, Arc::clone(&uploader));

    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let mut events = 0usize;
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayLine = serde_json::from_str(line)
            .with_context(|| format!("parsing line {}", lineno + 1))?;
        if let Some(ev) = record.event {
            let ack = consumer.ingest_batch(record.tab_id, "interval", vec![ev]);
            events += ack.accepted;
        }
        if let Some(r) = record.request_start {
            consumer.handle(tabtrace_core::pipeline::Command::RequestStart {
                tab_id: record.tab_id,
                kind: RequestKind::from_host_type(&r.kind),
                url: r.url,
                method: r.method,
                ts: r.ts,
            });
        }
        if let Some(r) = record.request_end {
            consumer.handle(tabtrace_core::pipeline::Command::RequestEnd {
                tab_id: record.tab_id,
                url: r.url,
                method: r.method,
                status: r.status,
                ts: r.ts,
            });
        }
        if let Some(r) = record.request_error {
            consumer.handle(tabtrace_core::pipeline::Command::RequestError {
                tab_id: record.tab_id,
                url: r.url,
                method: r.method,
                ts: r.ts,
            });
        }
    }
    tracing::info!(rows = events, "replay ingested");

    if upload {
        let outcome = uploader.drain_once(Some("replay"), now_ms()).await;
        tracing::info!(?outcome, "delivery attempted");
    }

    let path = export::write_export(out, consumer.buffer().rows(), now_ms())?;
    println!("{}", path.display());
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
