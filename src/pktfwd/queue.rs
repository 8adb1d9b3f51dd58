use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use super::config::ServerConf;

const LOCK_TIMEOUT_PUSH: Duration = Duration::from_secs(2);
const LOCK_TIMEOUT_POP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    UplinkSend,
    DownlinkPullRequest,
    DownlinkReceived,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::UplinkSend => write!(f, "uplink"),
            QueueKind::DownlinkPullRequest => write!(f, "downlink pull request"),
            QueueKind::DownlinkReceived => write!(f, "downlink received"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPacket {
    pub data: Vec<u8>,
    pub destination: Arc<ServerConf>,
    pub attempt: u32,
    /// Set once the retry path has logged this packet.
    pub logged: bool,
    /// Monotonic µs at which the downlink scheduler first looked at it.
    pub scheduled_at_us: Option<u64>,
}

impl QueuedPacket {
    pub fn new(data: Vec<u8>, destination: Arc<ServerConf>) -> Self {
        Self {
            data,
            destination,
            attempt: 0,
            logged: false,
            scheduled_at_us: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The three FIFOs between the control loop and the UDP workers.
///
/// Every lock is taken with a ceiling; a queue that cannot be locked in time
/// behaves as if it were empty (pop) or full (push).
#[derive(Debug, Default)]
pub struct PacketQueues {
    uplink_send: Mutex<VecDeque<QueuedPacket>>,
    downlink_pull_request: Mutex<VecDeque<QueuedPacket>>,
    downlink_received: Mutex<VecDeque<QueuedPacket>>,
}

impl PacketQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<VecDeque<QueuedPacket>> {
        match kind {
            QueueKind::UplinkSend => &self.uplink_send,
            QueueKind::DownlinkPullRequest => &self.downlink_pull_request,
            QueueKind::DownlinkReceived => &self.downlink_received,
        }
    }

    fn push(&self, kind: QueueKind, packet: QueuedPacket) -> bool {
        match self.queue(kind).try_lock_for(LOCK_TIMEOUT_PUSH) {
            Some(mut queue) => {
                queue.push_back(packet);
                true
            }
            None => {
                warn!("Failed to obtain {} queue lock, giving up on that packet", kind);
                false
            }
        }
    }

    /// Takes ownership of `data` and queues it with a zero attempt counter.
    pub fn enqueue(&self, kind: QueueKind, data: Vec<u8>, destination: Arc<ServerConf>) -> bool {
        self.push(kind, QueuedPacket::new(data, destination))
    }

    /// Front of the queue, `None` when empty or when the lock is contended.
    pub fn dequeue(&self, kind: QueueKind) -> Option<QueuedPacket> {
        self.queue(kind).try_lock_for(LOCK_TIMEOUT_POP)?.pop_front()
    }

    /// Puts a failed packet back with its attempt counter incremented.
    ///
    /// Returns `false`, dropping the packet, once `max_attempts` is reached.
    pub fn requeue(&self, kind: QueueKind, mut packet: QueuedPacket, max_attempts: u32) -> bool {
        if packet.attempt >= max_attempts {
            return false;
        }
        packet.attempt += 1;
        self.push(kind, packet)
    }

    /// Puts a packet back untouched, for downlinks that are not due yet.
    pub fn reschedule(&self, kind: QueueKind, packet: QueuedPacket) -> bool {
        self.push(kind, packet)
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).try_lock_for(LOCK_TIMEOUT_POP).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.len(kind) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Arc<ServerConf> {
        Arc::new(ServerConf::new("127.0.0.1", 1700))
    }

    #[test]
    fn fifo_order_per_queue() {
        let queues = PacketQueues::new();
        let dest = server();
        for k in 1..=3u8 {
            assert!(queues.enqueue(QueueKind::UplinkSend, vec![k], dest.clone()));
        }
        assert!(queues.enqueue(QueueKind::DownlinkReceived, vec![9], dest.clone()));

        assert_eq!(queues.len(QueueKind::UplinkSend), 3);
        for k in 1..=3u8 {
            let pkt = queues.dequeue(QueueKind::UplinkSend).unwrap();
            assert_eq!(pkt.data, vec![k]);
            assert_eq!(pkt.attempt, 0);
        }
        assert!(queues.dequeue(QueueKind::UplinkSend).is_none());
        assert!(queues.dequeue(QueueKind::DownlinkPullRequest).is_none());
        assert_eq!(queues.dequeue(QueueKind::DownlinkReceived).unwrap().data, vec![9]);
    }

    #[test]
    fn requeue_drops_on_the_call_after_max() {
        const MAX: u32 = 3;
        let queues = PacketQueues::new();
        queues.enqueue(QueueKind::UplinkSend, vec![1, 2, 3], server());

        for n in 1..=MAX {
            let pkt = queues.dequeue(QueueKind::UplinkSend).unwrap();
            assert!(queues.requeue(QueueKind::UplinkSend, pkt, MAX), "requeue {} must succeed", n);
        }
        let pkt = queues.dequeue(QueueKind::UplinkSend).unwrap();
        assert_eq!(pkt.attempt, MAX);
        assert!(!queues.requeue(QueueKind::UplinkSend, pkt, MAX));
        assert!(queues.is_empty(QueueKind::UplinkSend));
    }

    #[test]
    fn reschedule_keeps_attempt_and_schedule() {
        let queues = PacketQueues::new();
        queues.enqueue(QueueKind::DownlinkReceived, vec![0xAB], server());
        let mut pkt = queues.dequeue(QueueKind::DownlinkReceived).unwrap();
        pkt.scheduled_at_us = Some(42);
        assert!(queues.reschedule(QueueKind::DownlinkReceived, pkt));

        let pkt = queues.dequeue(QueueKind::DownlinkReceived).unwrap();
        assert_eq!(pkt.attempt, 0);
        assert_eq!(pkt.scheduled_at_us, Some(42));
    }

    #[test]
    fn contended_queue_reads_as_empty() {
        let queues = PacketQueues::new();
        queues.enqueue(QueueKind::UplinkSend, vec![1], server());
        let _held = queues.uplink_send.lock();
        assert!(queues.dequeue(QueueKind::UplinkSend).is_none());
    }
}
