use std::sync::atomic::{AtomicU32, Ordering};

/// Traffic counters shared by the control loop and the UDP workers.
///
/// Counters only grow; they are reset by restarting the process.
#[derive(Debug, Default)]
pub struct TrafficStats {
    recv_packets: AtomicU32,
    recv_packets_crc_good: AtomicU32,
    forw_packets: AtomicU32,
    forw_packets_acked: AtomicU32,
    downlink_received: AtomicU32,
    downlink_transmitted: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub recv_packets: u32,
    pub recv_packets_crc_good: u32,
    pub forw_packets: u32,
    pub forw_packets_acked: u32,
    pub downlink_received: u32,
    pub downlink_transmitted: u32,
}

impl StatsSnapshot {
    /// Percentage of forwarded datagrams that were acknowledged, 0 when none were sent.
    pub fn ack_ratio(&self) -> f64 {
        if self.forw_packets == 0 {
            return 0.0;
        }
        100.0 * self.forw_packets_acked as f64 / self.forw_packets as f64
    }
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        self.recv_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_received_crc_good(&self) {
        self.recv_packets_crc_good.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded(&self) {
        self.forw_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded_acked(&self) {
        self.forw_packets_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_downlink_received(&self) {
        self.downlink_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_downlink_transmitted(&self) {
        self.downlink_transmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            recv_packets: self.recv_packets.load(Ordering::Relaxed),
            recv_packets_crc_good: self.recv_packets_crc_good.load(Ordering::Relaxed),
            forw_packets: self.forw_packets.load(Ordering::Relaxed),
            forw_packets_acked: self.forw_packets_acked.load(Ordering::Relaxed),
            downlink_received: self.downlink_received.load(Ordering::Relaxed),
            downlink_transmitted: self.downlink_transmitted.load(Ordering::Relaxed),
        }
    }
}
