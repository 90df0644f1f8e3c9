//! Delivery counters.
//!
//! A [`DeliveryMetrics`] handle is created by the host and shared with the
//! exporter and its connection. Counters only ever increase.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Batches delivered successfully
    pub batches_sent: u64,

    /// Records delivered successfully
    pub records_sent: u64,

    /// Batches that failed after the retry
    pub batches_failed: u64,

    /// Individual transmission attempts that failed
    pub send_failures: u64,

    /// Reconnect cycles performed
    pub reconnects: u64,

    /// Connection attempts that failed
    pub connect_failures: u64,

    /// Shared-key handshakes that failed
    pub handshake_failures: u64,
}

/// Shared delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    batches_sent: AtomicU64,
    records_sent: AtomicU64,
    batches_failed: AtomicU64,
    send_failures: AtomicU64,
    reconnects: AtomicU64,
    connect_failures: AtomicU64,
    handshake_failures: AtomicU64,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch_sent(&self, records: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.records_sent.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current counter values.
    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_stats_default() {
        let stats = DeliveryMetrics::new().snapshot();
        assert_eq!(stats, DeliveryStats::default());
    }

    #[test]
    fn test_counters() {
        let metrics = DeliveryMetrics::new();
        metrics.record_batch_sent(10);
        metrics.record_batch_sent(5);
        metrics.record_batch_failed();
        metrics.record_send_failure();
        metrics.record_send_failure();
        metrics.record_reconnect();
        metrics.record_connect_failure();
        metrics.record_handshake_failure();

        let stats = metrics.snapshot();
        assert_eq!(stats.batches_sent, 2);
        assert_eq!(stats.records_sent, 15);
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.send_failures, 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.connect_failures, 1);
        assert_eq!(stats.handshake_failures, 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates() {
        let metrics = Arc::new(DeliveryMetrics::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        metrics.record_batch_sent(1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let stats = metrics.snapshot();
        assert_eq!(stats.batches_sent, 800);
        assert_eq!(stats.records_sent, 800);
    }
}
