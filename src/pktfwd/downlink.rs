use tracing::{debug, info, warn};

use crate::hal::{ChipSettings, RadioDriver};

use super::gps_time::gps_ms_to_unix_us;
use super::protocol::{parse_pull_resp, Txpk, TxSchedule};
use super::queue::{PacketQueues, QueueKind};
use super::radio::{transmit_downlink, TxStatus};
use super::stats::TrafficStats;
use super::time_utils::{curr_timestamp_us, monotonic_us};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownlinkModulation {
    Lora { sf: u8, bw_khz: f32, cr: u8 },
    Fsk { datarate: u32, freq_dev_hz: u32 },
}

/// A downlink resolved against the local clocks.
///
/// Either `send_immediately` is set, or both targets were derived from the
/// single `tmst` or `tmms` field the server sent.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkRequest {
    pub send_immediately: bool,
    pub target_unix_us: Option<u64>,
    pub target_internal_us: Option<u64>,
    pub modulation: DownlinkModulation,
    pub frequency_mhz: f64,
    pub power_dbm: i8,
    pub preamble: u16,
    pub no_crc: bool,
    pub invert_iq: bool,
    pub payload: Vec<u8>,
}

impl DownlinkRequest {
    pub fn from_txpk(txpk: Txpk, now_internal_us: u64, now_unix_us: u64) -> Self {
        let (send_immediately, target_unix_us, target_internal_us) = match txpk.schedule {
            TxSchedule::Immediate => (true, None, None),
            TxSchedule::Tmst(tmst) => {
                /* tmst is the low 32 bits of the internal clock; the wrapped
                 * difference locates the closest instance of it */
                let delta = tmst.wrapping_sub(now_internal_us as u32) as i32 as i64;
                let internal = (now_internal_us as i64 + delta).max(0) as u64;
                let unix = (now_unix_us as i64 + delta).max(0) as u64;
                (false, Some(unix), Some(internal))
            }
            TxSchedule::Tmms(tmms) => {
                let unix = gps_ms_to_unix_us(tmms);
                let delta = unix as i64 - now_unix_us as i64;
                let internal = (now_internal_us as i64 + delta).max(0) as u64;
                (false, Some(unix), Some(internal))
            }
        };

        DownlinkRequest {
            send_immediately,
            target_unix_us,
            target_internal_us,
            modulation: txpk.modulation,
            frequency_mhz: txpk.frequency_mhz,
            power_dbm: txpk.power_dbm,
            preamble: txpk.preamble,
            no_crc: txpk.no_crc,
            invert_iq: txpk.invert_iq,
            payload: txpk.payload,
        }
    }
}

/// Window around the target time inside which a downlink is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkPolicy {
    /// How far in the past a target may be and still be sent.
    pub too_late_us: u64,
    /// How far ahead of the target the scheduler commits to the radio.
    pub send_ahead_us: u64,
}

impl Default for DownlinkPolicy {
    fn default() -> Self {
        Self {
            too_late_us: 2_000_000,
            send_ahead_us: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    TransmitNow,
    TooLate,
    NotYet,
}

/// Where `target_us` (`None` for immediate) falls relative to `now_us`.
pub fn evaluate_schedule(target_us: Option<u64>, now_us: u64, policy: &DownlinkPolicy) -> ScheduleDecision {
    let target = match target_us {
        Some(t) => t,
        None => return ScheduleDecision::TransmitNow,
    };
    if now_us > target.saturating_add(policy.too_late_us) {
        ScheduleDecision::TooLate
    } else if target > now_us.saturating_add(policy.send_ahead_us) {
        ScheduleDecision::NotYet
    } else {
        ScheduleDecision::TransmitNow
    }
}

/// What one pass over the downlink queue did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkPass {
    pub transmitted: usize,
    /// `false` when the chip could not be put back into receive mode.
    pub rx_restored: bool,
}

/**
@brief Services the received-downlink queue once
@param queues shared queues, `DownlinkReceived` is drained
@param radio driver, back in receive mode on return unless `rx_restored` is cleared
@param settings receive configuration
@param policy scheduling window
@param stats txnb counter
@return downlinks transmitted and the receive-mode state

Packets not yet due are put back; every other packet leaves the queue. The pass
stops early when receive mode could not be restored.
*/
pub fn process_downlink_queue<R: RadioDriver>(
    queues: &PacketQueues,
    radio: &mut R,
    settings: &ChipSettings,
    policy: &DownlinkPolicy,
    stats: &TrafficStats,
) -> DownlinkPass {
    let mut pass = DownlinkPass {
        transmitted: 0,
        rx_restored: true,
    };
    let pending = queues.len(QueueKind::DownlinkReceived);

    for _ in 0..pending {
        let mut packet = match queues.dequeue(QueueKind::DownlinkReceived) {
            Some(p) => p,
            None => break,
        };

        let txpk = match parse_pull_resp(&packet.data) {
            Ok((_, txpk)) => txpk,
            Err(e) => {
                warn!("Dropping malformed downlink from {}: {}", packet.destination, e);
                continue;
            }
        };

        let now_us = monotonic_us();
        let request = DownlinkRequest::from_txpk(txpk, now_us, curr_timestamp_us());
        let target_us = if request.send_immediately {
            None
        } else {
            Some(*packet.scheduled_at_us.get_or_insert(request.target_internal_us.unwrap_or(now_us)))
        };

        match evaluate_schedule(target_us, now_us, policy) {
            ScheduleDecision::TooLate => {
                warn!(
                    "Downlink from {} is too late ({} us behind), dropped",
                    packet.destination,
                    now_us.saturating_sub(target_us.unwrap_or(now_us))
                );
            }
            ScheduleDecision::NotYet => {
                debug!("Downlink not due yet, rescheduling");
                if !queues.reschedule(QueueKind::DownlinkReceived, packet) {
                    warn!("Cannot reschedule downlink, dropped");
                }
            }
            ScheduleDecision::TransmitNow => {
                info!(
                    "Transmitting downlink from {}: {} bytes, {}",
                    packet.destination,
                    request.payload.len(),
                    if request.send_immediately { "immediate" } else { "timed" }
                );
                let outcome = transmit_downlink(radio, settings, &request, target_us, stats);
                if outcome.status == TxStatus::Sent {
                    pass.transmitted += 1;
                }
                if !outcome.rx_restored {
                    pass.rx_restored = false;
                    break;
                }
            }
        }
    }
    pass
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pktfwd::config::ServerConf;
    use crate::pktfwd::gps_time::unix_us_to_gps_ms;
    use crate::pktfwd::protocol::PROTOCOL_VERSION;
    use crate::pktfwd::radio::mock::MockChip;

    fn pull_resp(txpk: &str) -> Vec<u8> {
        let mut buf = vec![PROTOCOL_VERSION, 0x00, 0x01, 3];
        buf.extend_from_slice(format!(r#"{{"txpk":{}}}"#, txpk).as_bytes());
        buf
    }

    fn timed(tmst: u32) -> Vec<u8> {
        pull_resp(&format!(
            r#"{{"tmst":{},"freq":869.525,"powe":14,"modu":"LORA","datr":"SF9BW125","codr":"4/5","ipol":true,"data":"AQID"}}"#,
            tmst
        ))
    }

    fn gps_timed(tmms: u64) -> Vec<u8> {
        pull_resp(&format!(
            r#"{{"tmms":{},"freq":869.525,"powe":14,"modu":"LORA","datr":"SF9BW125","codr":"4/5","ipol":true,"data":"AQID"}}"#,
            tmms
        ))
    }

    fn server() -> Arc<ServerConf> {
        Arc::new(ServerConf::new("127.0.0.1", 1700))
    }

    fn lora_txpk(schedule: TxSchedule) -> Txpk {
        Txpk {
            schedule,
            frequency_mhz: 868.1,
            rf_chain: 0,
            power_dbm: 14,
            modulation: DownlinkModulation::Lora { sf: 7, bw_khz: 125.0, cr: 5 },
            invert_iq: true,
            preamble: 8,
            no_crc: true,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn schedule_window() {
        let policy = DownlinkPolicy::default();
        let now = 10_000_000;
        assert_eq!(evaluate_schedule(None, now, &policy), ScheduleDecision::TransmitNow);
        assert_eq!(evaluate_schedule(Some(now - 2_500_000), now, &policy), ScheduleDecision::TooLate);
        assert_eq!(evaluate_schedule(Some(now - 1_500_000), now, &policy), ScheduleDecision::TransmitNow);
        assert_eq!(evaluate_schedule(Some(now + 200_000), now, &policy), ScheduleDecision::TransmitNow);
        assert_eq!(evaluate_schedule(Some(now + 400_000), now, &policy), ScheduleDecision::NotYet);
    }

    #[test]
    fn tmst_resolves_across_wrap() {
        let now_internal = 0x1_FFFF_FF00u64;
        let request = DownlinkRequest::from_txpk(lora_txpk(TxSchedule::Tmst(0x0000_0100)), now_internal, 1_000_000_000);
        assert!(!request.send_immediately);
        assert_eq!(request.target_internal_us, Some(0x2_0000_0100));
        assert_eq!(request.target_unix_us, Some(1_000_000_512));

        let request = DownlinkRequest::from_txpk(lora_txpk(TxSchedule::Tmst(0xFFFF_FE00)), now_internal, 1_000_000_000);
        assert_eq!(request.target_internal_us, Some(0x1_FFFF_FE00));
    }

    #[test]
    fn tmms_resolves_through_unix_time() {
        let now_unix = gps_ms_to_unix_us(1_400_000_000_000);
        let request = DownlinkRequest::from_txpk(lora_txpk(TxSchedule::Tmms(1_400_000_001_500)), 5_000_000, now_unix);
        assert_eq!(request.target_unix_us, Some(now_unix + 1_500_000));
        assert_eq!(request.target_internal_us, Some(6_500_000));
    }

    #[test]
    fn immediate_has_no_target() {
        let request = DownlinkRequest::from_txpk(lora_txpk(TxSchedule::Immediate), 1, 2);
        assert!(request.send_immediately);
        assert_eq!(request.target_internal_us, None);
        assert_eq!(request.payload, vec![1, 2, 3]);
    }

    #[test]
    fn past_downlink_is_dropped() {
        let queues = PacketQueues::new();
        let stats = TrafficStats::new();
        let mut radio = MockChip::default();
        let past = (monotonic_us() as u32).wrapping_sub(10_000_000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        queues.enqueue(QueueKind::DownlinkReceived, timed(past), server());

        let policy = DownlinkPolicy {
            too_late_us: 1_000,
            send_ahead_us: 300_000,
        };
        let pass = process_downlink_queue(&queues, &mut radio, &ChipSettings::default(), &policy, &stats);
        assert_eq!(pass.transmitted, 0);
        assert!(radio.transmitted.is_empty());
        assert!(queues.is_empty(QueueKind::DownlinkReceived));
    }

    #[test]
    fn future_downlink_stays_queued() {
        let queues = PacketQueues::new();
        let stats = TrafficStats::new();
        let mut radio = MockChip::default();
        let future = (monotonic_us() as u32).wrapping_add(60_000_000);
        queues.enqueue(QueueKind::DownlinkReceived, timed(future), server());

        let pass = process_downlink_queue(&queues, &mut radio, &ChipSettings::default(), &DownlinkPolicy::default(), &stats);
        assert_eq!(pass.transmitted, 0);
        let packet = queues.dequeue(QueueKind::DownlinkReceived).unwrap();
        assert!(packet.scheduled_at_us.is_some());
        assert_eq!(packet.attempt, 0);
    }

    #[test]
    fn immediate_downlink_is_sent() {
        let queues = PacketQueues::new();
        let stats = TrafficStats::new();
        let mut radio = MockChip::default();
        queues.enqueue(
            QueueKind::DownlinkReceived,
            pull_resp(r#"{"imme":true,"freq":869.525,"modu":"LORA","datr":"SF12BW125","codr":"4/5","data":"AQID"}"#),
            server(),
        );
        queues.enqueue(QueueKind::DownlinkReceived, pull_resp(r#"{"imme":true}"#), server());

        let pass = process_downlink_queue(&queues, &mut radio, &ChipSettings::default(), &DownlinkPolicy::default(), &stats);
        assert_eq!(pass.transmitted, 1);
        assert!(pass.rx_restored);
        assert_eq!(radio.transmitted, vec![vec![1, 2, 3]]);
        assert!(radio.held_until.is_empty());
        assert_eq!(stats.snapshot().downlink_transmitted, 1);
        assert!(queues.is_empty(QueueKind::DownlinkReceived));
    }

    #[test]
    fn tmms_downlinks_through_the_queue() {
        let queues = PacketQueues::new();
        let stats = TrafficStats::new();
        let mut radio = MockChip::default();
        let now_gps_ms = unix_us_to_gps_ms(curr_timestamp_us());
        for tmms in [now_gps_ms + 60_000, now_gps_ms + 100, now_gps_ms - 10_000] {
            queues.enqueue(QueueKind::DownlinkReceived, gps_timed(tmms), server());
        }

        let pass = process_downlink_queue(&queues, &mut radio, &ChipSettings::default(), &DownlinkPolicy::default(), &stats);
        assert_eq!(pass.transmitted, 1);
        assert_eq!(radio.transmitted, vec![vec![1, 2, 3]]);
        assert_eq!(radio.held_until.len(), 1);

        /* only the far future one is left */
        let packet = queues.dequeue(QueueKind::DownlinkReceived).unwrap();
        assert!(packet.scheduled_at_us.unwrap() > monotonic_us() + 50_000_000);
        assert!(queues.is_empty(QueueKind::DownlinkReceived));
    }

    #[test]
    fn failed_restore_ends_the_pass() {
        let queues = PacketQueues::new();
        let stats = TrafficStats::new();
        let mut radio = MockChip {
            begin_failures: usize::MAX,
            ..Default::default()
        };
        let immediate = r#"{"imme":true,"freq":869.525,"modu":"LORA","datr":"SF12BW125","codr":"4/5","data":"AQID"}"#;
        queues.enqueue(QueueKind::DownlinkReceived, pull_resp(immediate), server());
        queues.enqueue(QueueKind::DownlinkReceived, pull_resp(immediate), server());

        let pass = process_downlink_queue(&queues, &mut radio, &ChipSettings::default(), &DownlinkPolicy::default(), &stats);
        assert_eq!(pass.transmitted, 1);
        assert!(!pass.rx_restored);
        assert_eq!(queues.len(QueueKind::DownlinkReceived), 1);
    }
}
