//! Fluent Forward Exporter - forwards log batches to a Fluentd / Fluent Bit collector
//!
//! This binary reads log batches from stdin, one JSON-encoded batch per
//! line, and delivers each batch as a single Forward-protocol message.
//!
//! ## Features
//!
//! - Forward and gzip-compressed PackedForward modes
//! - Optional TLS, shared-key authentication and acknowledgements
//! - One reconnect-and-retry per batch
//! - Graceful shutdown on EOF or SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `FLUENT_FORWARD_ENDPOINT`: collector address (default: localhost:24224)
//! - `FLUENT_FORWARD_TAG`: routing tag (default: tag)
//! - `FLUENT_FORWARD_CONNECTION_TIMEOUT_SECS`: connect timeout (default: 30)
//! - `FLUENT_FORWARD_COMPRESS_GZIP`: use PackedForward with gzip (default: false)
//! - `FLUENT_FORWARD_REQUIRE_ACK`: wait for server acks (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fluent_forward_exporter::config::Config;
use fluent_forward_exporter::connection::ForwardLink;
use fluent_forward_exporter::exporter::FluentForwardExporter;
use fluent_forward_exporter::logs::Logs;
use fluent_forward_exporter::metrics::DeliveryMetrics;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Fluent Forward exporter...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint = %config.endpoint,
                tag = %config.tag,
                compress_gzip = config.compress_gzip,
                require_ack = config.require_ack,
                connection_timeout_secs = config.connection_timeout.as_secs(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(DeliveryMetrics::new());
    let exporter = match FluentForwardExporter::new(&config, metrics) {
        Ok(exporter) => exporter,
        Err(e) => {
            error!(error = %e, "Failed to create exporter");
            std::process::exit(1);
        }
    };

    if let Err(e) = exporter.start().await {
        error!(error = %e, "Failed to start exporter");
        std::process::exit(1);
    }

    info!("Exporter running. Reading batches from stdin, press Ctrl+C to stop.");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping after the current batch..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let stdin = BufReader::new(tokio::io::stdin());
    forward_batches(&exporter, stdin, shutdown_rx).await;

    // Graceful shutdown
    if let Err(e) = exporter.stop().await {
        warn!(error = %e, "Failed to close connection cleanly");
    }

    let stats = exporter.stats();
    info!(
        batches_sent = stats.batches_sent,
        records_sent = stats.records_sent,
        batches_failed = stats.batches_failed,
        send_failures = stats.send_failures,
        reconnects = stats.reconnects,
        "Fluent Forward exporter stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Deliver every batch read from `input` until EOF or shutdown.
///
/// Shutdown is only observed between batches, so a delivery in progress
/// always runs to completion. Lines that do not parse are skipped; delivery
/// failures are logged and the next batch is attempted.
async fn forward_batches<L, R>(
    exporter: &FluentForwardExporter<L>,
    input: R,
    mut shutdown: watch::Receiver<bool>,
) where
    L: ForwardLink,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut line_number: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            next = lines.next_line() => next,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Signal listener is gone; keep reading until EOF.
                    lines.next_line().await
                } else {
                    continue;
                }
            }
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Input closed, stopping...");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read input");
                break;
            }
        };
        line_number += 1;

        let Some(logs) = parse_batch(&line, line_number) else {
            continue;
        };

        // Failures are already logged and counted by the exporter
        let _ = exporter.deliver(&logs).await;
    }
}

fn parse_batch(line: &str, line_number: u64) -> Option<Logs> {
    if line.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<Logs>(line) {
        Ok(logs) => Some(logs),
        Err(e) => {
            warn!(line = line_number, error = %e, "Skipping malformed batch");
            None
        }
    }
}
