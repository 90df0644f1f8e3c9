//! Delivery engine facade.
//!
//! [`FluentForwardExporter`] ties translation, the connection and the sender
//! together behind `start` / `deliver` / `stop`. Deliveries are serialised
//! on the link; `stop` waits for every delivery already in progress before
//! closing the connection.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionManager, ConnectionSettings, ConnectionState, ForwardLink};
use crate::error::ForwardError;
use crate::logs::Logs;
use crate::metrics::{DeliveryMetrics, DeliveryStats};
use crate::protocol::{Entry, EventClock};
use crate::sender::Sender;
use crate::tls::TlsContext;
use crate::translator::{translate, TranslatorConfig};

/// Exports log batches to a Fluent Forward collector.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use fluent_forward_exporter::{Config, DeliveryMetrics, FluentForwardExporter, Logs};
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::from_env().expect("Failed to load config");
///     let metrics = Arc::new(DeliveryMetrics::new());
///     let exporter = FluentForwardExporter::new(&config, metrics).expect("Invalid config");
///
///     exporter.start().await.ok();
///     exporter.deliver(&Logs::default()).await.ok();
///     exporter.stop().await.ok();
/// }
/// ```
pub struct FluentForwardExporter<L: ForwardLink = ConnectionManager> {
    endpoint: String,
    translator: TranslatorConfig,
    sender: Sender,
    link: Mutex<L>,
    /// `true` once stopped; deliveries hold the read side while running
    stopped: RwLock<bool>,
    metrics: Arc<DeliveryMetrics>,
}

impl FluentForwardExporter<ConnectionManager> {
    /// Create an exporter connecting to `config.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid, or if TLS with
    /// certificate verification is enabled (use [`Self::with_tls`] then).
    pub fn new(config: &Config, metrics: Arc<DeliveryMetrics>) -> Result<Self, ConfigError> {
        let tls = TlsContext::from_settings(&config.tls, config.endpoint_host())?;
        Self::with_connection(config, tls, metrics)
    }

    /// Create an exporter that wraps its connection in the given TLS context.
    pub fn with_tls(
        config: &Config,
        tls: TlsContext,
        metrics: Arc<DeliveryMetrics>,
    ) -> Result<Self, ConfigError> {
        Self::with_connection(config, Some(tls), metrics)
    }

    fn with_connection(
        config: &Config,
        tls: Option<TlsContext>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Result<Self, ConfigError> {
        let link = ConnectionManager::new(ConnectionSettings::from(config), tls, metrics.clone());
        Self::with_link(config, link, metrics)
    }
}

impl<L: ForwardLink> FluentForwardExporter<L> {
    /// Create an exporter over an arbitrary link.
    pub fn with_link(
        config: &Config,
        link: L,
        metrics: Arc<DeliveryMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        info!(
            endpoint = %config.endpoint,
            tag = %config.tag,
            mode = %config.send_mode(),
            require_ack = config.require_ack,
            tls = config.tls.enabled,
            "Creating the Fluent Forward exporter"
        );

        Ok(Self {
            endpoint: config.endpoint.clone(),
            translator: config.translator_config(),
            sender: Sender::new(config.tag.clone(), config.send_mode(), metrics.clone()),
            link: Mutex::new(link),
            stopped: RwLock::new(false),
            metrics,
        })
    }

    /// Open the connection.
    ///
    /// A collector that is not reachable yet is logged and tolerated; the
    /// first delivery's retry reconnects.
    pub async fn start(&self) -> Result<(), ForwardError> {
        let mut link = self.link.lock().await;

        if let Err(e) = link.reconnect().await {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to release previous connection");
        }

        if link.state() == ConnectionState::Disconnected {
            error!(
                endpoint = %self.endpoint,
                "The exporter failed to connect to its endpoint {} when starting",
                self.endpoint
            );
        }

        Ok(())
    }

    /// Deliver one batch as a single message.
    ///
    /// Records keep their input order and get non-decreasing event times.
    /// An empty batch sends nothing.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::Stopped` after [`Self::stop`], otherwise the
    /// error of the last failed attempt.
    pub async fn deliver(&self, logs: &Logs) -> Result<(), ForwardError> {
        let stopped = self.stopped.read().await;
        if *stopped {
            return Err(ForwardError::Stopped);
        }

        if logs.record_count() == 0 {
            return Ok(());
        }

        let entries = self.translate(logs);

        let mut link = self.link.lock().await;
        match self.sender.send(&mut *link, &entries).await {
            Ok(()) => {
                debug!(entries = entries.len(), "Batch delivered");
                Ok(())
            }
            Err(e) => {
                error!(
                    endpoint = %self.endpoint,
                    entries = entries.len(),
                    error = %e,
                    "Failed to deliver batch"
                );
                Err(e)
            }
        }
    }

    /// Stop accepting batches, wait for in-flight ones and disconnect.
    pub async fn stop(&self) -> Result<(), ForwardError> {
        let mut stopped = self.stopped.write().await;
        *stopped = true;

        let mut link = self.link.lock().await;
        link.disconnect().await?;

        info!(endpoint = %self.endpoint, "Fluent Forward exporter stopped");
        Ok(())
    }

    pub fn stats(&self) -> DeliveryStats {
        self.metrics.snapshot()
    }

    fn translate(&self, logs: &Logs) -> Vec<Entry> {
        let mut clock = EventClock::default();
        logs.records()
            .map(|(resource, record)| {
                Entry::new(clock.tick(), translate(record, resource, &self.translator))
            })
            .collect()
    }
}
