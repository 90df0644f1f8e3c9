//! Fluent Forward Exporter Library
//!
//! This library delivers batches of structured log records to a Fluentd /
//! Fluent Bit collector over the Fluent Forward protocol:
//!
//! - **config**: Environment-based configuration for the exporter
//! - **logs**: Inbound log batch model (resources, scopes, records)
//! - **translator**: Log record to Forward record translation
//! - **protocol**: MessagePack wire shapes (forward, packed forward, ack, handshake)
//! - **connection**: TCP/TLS connection with shared-key authentication
//! - **sender**: Transmission with a single reconnect-and-retry
//! - **exporter**: `start` / `deliver` / `stop` facade
//! - **metrics**: Injected delivery counters
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fluent_forward_exporter::config::Config;
//! use fluent_forward_exporter::exporter::FluentForwardExporter;
//! use fluent_forward_exporter::logs::{LogRecord, Logs, Resource, ResourceLogs};
//! use fluent_forward_exporter::metrics::DeliveryMetrics;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Create and start the exporter
//!     let metrics = Arc::new(DeliveryMetrics::new());
//!     let exporter = FluentForwardExporter::new(&config, metrics).expect("Invalid config");
//!     exporter.start().await.ok();
//!
//!     // Deliver a batch
//!     let logs = Logs::new(vec![ResourceLogs::new(
//!         Resource::default(),
//!         vec![LogRecord::new("INFO", "service started")],
//!     )]);
//!     exporter.deliver(&logs).await.ok();
//!
//!     exporter.stop().await.ok();
//! }
//! ```

// Module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod exporter;
pub mod logs;
pub mod metrics;
pub mod protocol;
pub mod record;
pub mod sender;
pub mod tls;
pub mod translator;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use config::{Config, ConfigError, TlsSettings};
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState, ForwardLink};
pub use error::ForwardError;
pub use exporter::FluentForwardExporter;
pub use logs::{AnyValue, Attributes, LogRecord, Logs, Resource, ResourceLogs, ScopeLogs};
pub use metrics::{DeliveryMetrics, DeliveryStats};
pub use protocol::{Entry, EventTime, SendMode};
pub use record::{Record, Value};
pub use sender::Sender;
pub use tls::TlsContext;
pub use translator::{translate, KubernetesMetadata, TranslatorConfig};
