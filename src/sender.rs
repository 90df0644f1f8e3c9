//! Sender: one transmission attempt, and at most one retry after a reconnect.
//!
//! Retry scheduling beyond that single attempt is the host's concern.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::ForwardLink;
use crate::error::ForwardError;
use crate::metrics::DeliveryMetrics;
use crate::protocol::{Entry, SendMode};

/// Sends translated batches over a [`ForwardLink`].
#[derive(Debug, Clone)]
pub struct Sender {
    tag: String,
    mode: SendMode,
    metrics: Arc<DeliveryMetrics>,
}

impl Sender {
    pub fn new(tag: impl Into<String>, mode: SendMode, metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            tag: tag.into(),
            mode,
            metrics,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn mode(&self) -> SendMode {
        self.mode
    }

    /// Send one batch as a single message.
    ///
    /// On failure the link is reconnected and the batch sent exactly once
    /// more. A failed reconnect is returned without retransmitting; a failed
    /// second attempt returns that attempt's error.
    pub async fn send<L: ForwardLink + ?Sized>(
        &self,
        link: &mut L,
        entries: &[Entry],
    ) -> Result<(), ForwardError> {
        let first = match link.transmit(self.mode, &self.tag, entries).await {
            Ok(()) => {
                self.metrics.record_batch_sent(entries.len());
                return Ok(());
            }
            Err(e) => e,
        };

        self.metrics.record_send_failure();
        warn!(
            error = %first,
            mode = %self.mode,
            entries = entries.len(),
            "Transmission failed, reconnecting to retry once"
        );

        if let Err(e) = link.reconnect().await {
            self.metrics.record_batch_failed();
            return Err(e);
        }

        match link.transmit(self.mode, &self.tag, entries).await {
            Ok(()) => {
                debug!(entries = entries.len(), "Retry succeeded");
                self.metrics.record_batch_sent(entries.len());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_failure();
                self.metrics.record_batch_failed();
                warn!(error = %e, "Retry failed, giving up on batch");
                Err(e)
            }
        }
    }
}
