//! Stack counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live packet counters, updated lock-free from the stack tasks
#[derive(Debug, Default)]
pub struct StackStats {
    pub(crate) packets_in: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) packets_out: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) udp_datagrams_in: AtomicU64,
    pub(crate) udp_datagrams_out: AtomicU64,
    pub(crate) tcp_segments_in: AtomicU64,
    pub(crate) tcp_segments_dropped: AtomicU64,
    pub(crate) tcp_connections_accepted: AtomicU64,
    /// Gauge maintained by the TCP task
    pub(crate) tcp_connections_active: AtomicU64,
    pub(crate) malformed_packets: AtomicU64,
    pub(crate) dropped_packets: AtomicU64,
    pub(crate) udp_endpoints_created: AtomicU64,
}

impl StackStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set(counter: &AtomicU64, n: usize) {
        counter.store(n as u64, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters
    pub fn snapshot(&self, udp_endpoints_active: usize) -> StatsSnapshot {
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            udp_datagrams_in: self.udp_datagrams_in.load(Ordering::Relaxed),
            udp_datagrams_out: self.udp_datagrams_out.load(Ordering::Relaxed),
            tcp_segments_in: self.tcp_segments_in.load(Ordering::Relaxed),
            tcp_segments_dropped: self.tcp_segments_dropped.load(Ordering::Relaxed),
            tcp_connections_accepted: self.tcp_connections_accepted.load(Ordering::Relaxed),
            tcp_connections_active: self.tcp_connections_active.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            udp_endpoints_created: self.udp_endpoints_created.load(Ordering::Relaxed),
            udp_endpoints_active: udp_endpoints_active as u64,
        }
    }
}

/// Serializable copy of [`StackStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub udp_datagrams_in: u64,
    pub udp_datagrams_out: u64,
    pub tcp_segments_in: u64,
    pub tcp_segments_dropped: u64,
    pub tcp_connections_accepted: u64,
    pub tcp_connections_active: u64,
    pub malformed_packets: u64,
    pub dropped_packets: u64,
    pub udp_endpoints_created: u64,
    pub udp_endpoints_active: u64,
}
