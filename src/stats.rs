//! Relay traffic counters.
//!
//! Lock-free atomic counters shared between the engine loop and the
//! shutdown path. Logged as a summary block when the engine stops.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one engine run.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Datagrams relayed peer → game (counter)
    pub ingress_datagrams: AtomicU64,
    /// Bytes relayed peer → game (counter)
    pub ingress_bytes: AtomicU64,
    /// Datagrams relayed game → peer (counter)
    pub egress_datagrams: AtomicU64,
    /// Bytes relayed game → peer (counter)
    pub egress_bytes: AtomicU64,
    /// Largest payload datagram observed (gauge, high-water mark)
    pub max_datagram_size: AtomicU64,
    /// Datagrams dropped because a slot queue was full (counter)
    pub queue_full_drops: AtomicU64,
    /// Datagrams dropped because the peer table was full (counter)
    pub table_full_drops: AtomicU64,
    /// Datagrams discarded as truncated by the receive buffer (counter)
    pub truncation_drops: AtomicU64,
    /// Malformed control frames dropped (counter)
    pub control_anomalies: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one relayed datagram in the peer → game direction.
    pub fn count_ingress(&self, len: usize) {
        self.ingress_datagrams.fetch_add(1, Ordering::Relaxed);
        self.ingress_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.max_datagram_size.fetch_max(len as u64, Ordering::Relaxed);
    }

    /// Record one relayed datagram in the game → peer direction.
    pub fn count_egress(&self, len: usize) {
        self.egress_datagrams.fetch_add(1, Ordering::Relaxed);
        self.egress_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.max_datagram_size.fetch_max(len as u64, Ordering::Relaxed);
    }

    /// Log the end-of-run summary.
    pub fn log_summary(&self) {
        log::info!("*********************** STATS ***********************");
        log::info!(
            "peer -> game: {} datagrams, {} bytes",
            self.ingress_datagrams.load(Ordering::Relaxed),
            self.ingress_bytes.load(Ordering::Relaxed),
        );
        log::info!(
            "game -> peer: {} datagrams, {} bytes",
            self.egress_datagrams.load(Ordering::Relaxed),
            self.egress_bytes.load(Ordering::Relaxed),
        );
        log::info!(
            "max datagram size: {}",
            self.max_datagram_size.load(Ordering::Relaxed)
        );
        log::info!(
            "drops: {} queue-full, {} table-full, {} truncated, {} bad control",
            self.queue_full_drops.load(Ordering::Relaxed),
            self.table_full_drops.load(Ordering::Relaxed),
            self.truncation_drops.load(Ordering::Relaxed),
            self.control_anomalies.load(Ordering::Relaxed),
        );
        log::info!("*********************** STATS ***********************");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default_zero() {
        let s = RelayStats::new();
        assert_eq!(s.ingress_datagrams.load(Ordering::Relaxed), 0);
        assert_eq!(s.egress_datagrams.load(Ordering::Relaxed), 0);
        assert_eq!(s.max_datagram_size.load(Ordering::Relaxed), 0);
        assert_eq!(s.queue_full_drops.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_direction_counters() {
        let s = RelayStats::new();
        s.count_ingress(100);
        s.count_ingress(50);
        s.count_egress(8);
        assert_eq!(s.ingress_datagrams.load(Ordering::Relaxed), 2);
        assert_eq!(s.ingress_bytes.load(Ordering::Relaxed), 150);
        assert_eq!(s.egress_datagrams.load(Ordering::Relaxed), 1);
        assert_eq!(s.egress_bytes.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_max_datagram_high_water_mark() {
        let s = RelayStats::new();
        s.count_ingress(64);
        s.count_egress(1400);
        s.count_ingress(512);
        assert_eq!(s.max_datagram_size.load(Ordering::Relaxed), 1400);
    }
}
