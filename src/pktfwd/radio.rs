use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, error, info, warn};

use crate::hal::error::Error;
use crate::hal::helper::{hex_dump, wait_ms};
use crate::hal::loragw_com::RadioCom;
use crate::hal::loragw_timestamp::compute_rf_tx_timestamp_correction_us;
use crate::hal::{
    bw_from_khz, is_ppm_on, ChipRegistry, ChipSettings, LoraChip, RadioDriver, SignalQuality, SpreadingFactor, LGW_MAX_PAYLOAD,
};

use super::downlink::{DownlinkModulation, DownlinkRequest};
use super::stats::TrafficStats;
use super::time_utils::{ascii_time, curr_timestamp_us};

pub const STARTUP_RESTART_ATTEMPTS: u32 = 200;

const DEFAULT_OUTPUT_POWER_DBM: i8 = 17;
const DEFAULT_CURRENT_LIMIT_MA: u8 = 100;
const RESET_SETTLE_MS: u32 = 10;

/// One frame as it came off the air.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioFrame {
    pub payload: Vec<u8>,
    pub rssi: f32,
    pub snr: f32,
    pub freq_error: f32,
    pub spreading_factor: u8,
    pub bandwidth_khz: f32,
    pub frequency_mhz: f32,
    /// Local monotonic clock at the end of reception.
    pub timestamp_us: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecvStatus {
    NoData,
    Data(RadioFrame),
    /// Something was on the air but could not be decoded.
    ReceiveFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Sent,
    Failed,
}

/// Result of a downlink, including whether the chip went back to receive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub status: TxStatus,
    pub rx_restored: bool,
}

/// Looks up `settings.ic_model` in the registry and binds it to `com`.
pub fn instantiate_radio<C: RadioCom + 'static>(
    registry: &ChipRegistry<C>,
    com: C,
    settings: &ChipSettings,
) -> Result<LoraChip<C>, Error> {
    let radio = registry.instantiate(&settings.ic_model, com)?;
    info!("Instantiated {} radio driver", settings.ic_model);
    Ok(radio)
}

fn step(name: &str, result: Result<(), Error>) -> Result<(), Error> {
    result.map_err(|e| {
        debug!("Radio {} failed, code {} ({})", name, e.code(), e);
        e
    })
}

/**
@brief Restart sequence: reset, bring-up and the full LoRa receive configuration
@param radio driver to configure
@param settings configured RF parameters
@return the status of the first step that failed
*/
pub fn reconfigure<R: RadioDriver>(radio: &mut R, settings: &ChipSettings) -> Result<(), Error> {
    if settings.pin_rst > -1 {
        step("reset", radio.reset())?;
        wait_ms(RESET_SETTLE_MS);
    }

    step("begin", radio.begin())?;
    step("frequency", radio.set_frequency(settings.carrier_frequency_mhz))?;
    step("bandwidth", radio.set_bandwidth(settings.bandwidth_khz))?;
    step("spreading factor", radio.set_spreading_factor(settings.spreading_factor.initial()))?;
    step("coding rate", radio.set_coding_rate(settings.coding_rate))?;
    step("sync word", radio.set_sync_word(settings.sync_word))?;
    step("preamble", radio.set_preamble_length(settings.preamble_length))?;

    let (min_power, max_power) = radio.output_power_range();
    step("output power", radio.set_output_power(DEFAULT_OUTPUT_POWER_DBM.clamp(min_power, max_power)))?;
    step("current limit", radio.set_current_limit(DEFAULT_CURRENT_LIMIT_MA))?;
    step("crc", radio.set_crc(true))?;
    step("iq", radio.invert_iq(false))?;
    Ok(())
}

/// Runs [`reconfigure`] up to `attempts` times; `false` once all of them failed.
pub fn restart_with_retries<R: RadioDriver>(radio: &mut R, settings: &ChipSettings, attempts: u32) -> bool {
    for attempt in 1..=attempts {
        match reconfigure(radio, settings) {
            Ok(()) => {
                debug!("{} chip ready after {} attempt(s)", radio.model(), attempt);
                return true;
            }
            Err(e) => {
                warn!(
                    "{} chip restart attempt {}/{} failed, code {} ({})",
                    radio.model(),
                    attempt,
                    attempts,
                    e.code(),
                    e
                );
            }
        }
    }
    error!("{} chip restart failed after {} attempts", radio.model(), attempts);
    false
}

/**
@brief Repeats the restart sequence until the chip is back in receive mode
@param radio driver to configure
@param settings configured RF parameters
@param attempts restart attempts per round
@param keep_running checked between rounds
@param heartbeat bumped every round so a supervisor sees progress
@return `false` only when asked to stop first
*/
pub fn recover_receive_mode<R: RadioDriver>(
    radio: &mut R,
    settings: &ChipSettings,
    attempts: u32,
    keep_running: &AtomicBool,
    heartbeat: &AtomicU64,
) -> bool {
    while keep_running.load(Ordering::Relaxed) {
        heartbeat.fetch_add(1, Ordering::Relaxed);
        if restart_with_retries(radio, settings, attempts) {
            info!("{} chip back in receive mode", radio.model());
            return true;
        }
    }
    false
}

/**
@brief One reception cycle: a fixed-SF receive, or a CAD sweep over SF7..SF12
@param radio configured driver
@param settings configured RF parameters
@param stats counters updated with rx/rx-ok
@param buf scratch buffer, at least the maximum payload size
@return what was heard
*/
pub fn receive_uplink<R: RadioDriver>(
    radio: &mut R,
    settings: &ChipSettings,
    stats: &TrafficStats,
    buf: &mut [u8],
) -> RecvStatus {
    let mut spreading_factor = settings.spreading_factor.initial();
    let mut preamble_seen = false;

    let result = match settings.spreading_factor {
        SpreadingFactor::Fixed(_) => radio.receive(buf),
        SpreadingFactor::ScanAll => {
            let mut result = Err(Error::RxTimeout);
            for sf in SpreadingFactor::SCAN_MIN..=SpreadingFactor::SCAN_MAX {
                if let Err(e) = radio.set_spreading_factor(sf) {
                    warn!("Cannot switch to SF{}, code {} ({})", sf, e.code(), e);
                    continue;
                }
                match radio.scan_channel() {
                    Ok(true) => {
                        spreading_factor = sf;
                        preamble_seen = true;
                        result = radio.receive(buf);
                        debug!("Got preamble at SF{}", sf);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => debug!("Channel scan at SF{} failed, code {} ({})", sf, e.code(), e),
                }
            }
            result
        }
    };

    match result {
        Ok(len) => {
            let timestamp_us = radio.micros();
            let quality = radio.signal_quality().unwrap_or(SignalQuality::SENTINEL);
            let payload = buf[..len.min(buf.len())].to_vec();

            stats.inc_received();
            stats.inc_received_crc_good();

            info!(
                "({}) Received packet: RSSI {:.1} dBm, SNR {} dB, frequency error {} Hz, {} bytes",
                ascii_time((curr_timestamp_us() / 1_000_000) as i64),
                quality.rssi,
                quality.snr,
                quality.freq_error,
                payload.len()
            );
            debug!("\n{}", hex_dump(&payload));

            RecvStatus::Data(RadioFrame {
                payload,
                rssi: quality.rssi,
                snr: quality.snr,
                freq_error: quality.freq_error,
                spreading_factor,
                bandwidth_khz: settings.bandwidth_khz,
                frequency_mhz: settings.carrier_frequency_mhz,
                timestamp_us,
            })
        }
        Err(Error::CrcMismatch) | Err(Error::LoraHeaderDamaged) => {
            stats.inc_received();
            warn!(
                "({}) Received packet CRC error - ignored!",
                ascii_time((curr_timestamp_us() / 1_000_000) as i64)
            );
            RecvStatus::ReceiveFailed
        }
        Err(e) => {
            if !e.is_reception_miss() {
                warn!("Receive failed, code {} ({})", e.code(), e);
            }
            if preamble_seen {
                RecvStatus::ReceiveFailed
            } else {
                RecvStatus::NoData
            }
        }
    }
}

fn apply_downlink_modulation<R: RadioDriver>(radio: &mut R, request: &DownlinkRequest) -> Result<(), Error> {
    radio.set_frequency(request.frequency_mhz as f32)?;
    match request.modulation {
        DownlinkModulation::Lora { sf, bw_khz, cr } => {
            radio.set_bandwidth(bw_khz)?;
            radio.set_spreading_factor(sf)?;
            radio.set_coding_rate(cr)?;
            radio.set_preamble_length(request.preamble)?;
        }
        DownlinkModulation::Fsk { datarate, freq_dev_hz } => {
            radio.configure_fsk(datarate, freq_dev_hz)?;
            radio.set_preamble_length(request.preamble)?;
        }
    }
    let (min_power, max_power) = radio.output_power_range();
    radio.set_output_power(request.power_dbm.clamp(min_power, max_power))?;
    radio.set_crc(!request.no_crc)?;
    radio.invert_iq(request.invert_iq)?;
    Ok(())
}

/// Delay between the transmit command and the first radiated bit.
pub fn tx_start_correction_us(request: &DownlinkRequest, spi_speed_hz: u32) -> u32 {
    let size = request.payload.len() as u32;
    match request.modulation {
        DownlinkModulation::Lora { sf, bw_khz, cr } => compute_rf_tx_timestamp_correction_us(
            0,
            size,
            sf as u32,
            bw_khz as u32,
            cr as u32,
            !request.no_crc,
            is_ppm_on(bw_from_khz(bw_khz), sf as u32),
            spi_speed_hz,
        ),
        DownlinkModulation::Fsk { datarate, .. } => {
            compute_rf_tx_timestamp_correction_us(datarate, size, 0, 0, 0, !request.no_crc, false, spi_speed_hz)
        }
    }
}

/**
@brief Sends one downlink at `target_us` on the local clock, then returns to receive mode
@param radio driver, put back into reception whatever the outcome
@param settings receive configuration restored afterwards
@param request validated downlink
@param target_us local monotonic time of the first radiated bit, `None` to send now
@param stats txnb is counted on success
@return the transmit status and whether the receive configuration was restored
*/
pub fn transmit_downlink<R: RadioDriver>(
    radio: &mut R,
    settings: &ChipSettings,
    request: &DownlinkRequest,
    target_us: Option<u64>,
    stats: &TrafficStats,
) -> TxOutcome {
    let mut status = TxStatus::Failed;

    if request.payload.len() >= LGW_MAX_PAYLOAD {
        warn!("Downlink of {} bytes exceeds the radio buffer, dropped", request.payload.len());
    } else {
        match apply_downlink_modulation(radio, request) {
            Ok(()) => {
                if let Some(target_us) = target_us {
                    let correction = tx_start_correction_us(request, settings.spi_speed_hz) as u64;
                    radio.hold_until(target_us.saturating_sub(correction));
                }
                match radio.transmit(&request.payload) {
                    Ok(()) => {
                        stats.inc_downlink_transmitted();
                        info!(
                            "Downlink sent: {} bytes at {} MHz, {} dBm",
                            request.payload.len(),
                            request.frequency_mhz,
                            request.power_dbm
                        );
                        status = TxStatus::Sent;
                    }
                    Err(e) => warn!("Downlink transmit failed, code {} ({})", e.code(), e),
                }
            }
            Err(e) => warn!("Cannot configure radio for downlink, code {} ({})", e.code(), e),
        }
    }

    let rx_restored = restart_with_retries(radio, settings, STARTUP_RESTART_ATTEMPTS);
    if !rx_restored {
        error!("Cannot restore receive mode after downlink");
    }
    TxOutcome { status, rx_restored }
}

#[cfg(test)]
pub(crate) mod mock {
    use crate::hal::error::Error;
    use crate::hal::{ChipFamily, RadioDriver, SignalQuality};

    /// Scripted driver recording the calls the control logic makes.
    #[derive(Debug, Default)]
    pub struct MockChip {
        pub sf_calls: Vec<u8>,
        pub receive_calls: usize,
        pub resets: usize,
        pub begins: usize,
        pub powers: Vec<i8>,
        pub fsk: Option<(u32, u32)>,
        pub transmitted: Vec<Vec<u8>>,
        pub held_until: Vec<u64>,
        pub iq: Vec<bool>,

        /// SF at which a CAD reports a preamble.
        pub preamble_at_sf: Option<u8>,
        pub rx_result: Option<Result<Vec<u8>, Error>>,
        pub begin_failures: usize,
        /// Spreading factors the chip refuses.
        pub sf_failures: Vec<u8>,
        pub tx_error: Option<Error>,
        pub quality: Option<SignalQuality>,
        pub clock_us: u64,
        pub(crate) current_sf: u8,
    }

    impl RadioDriver for MockChip {
        fn model(&self) -> &str {
            "MOCK"
        }

        fn family(&self) -> ChipFamily {
            ChipFamily::WithFrequencyError
        }

        fn reset(&mut self) -> Result<(), Error> {
            self.resets += 1;
            Ok(())
        }

        fn begin(&mut self) -> Result<(), Error> {
            self.begins += 1;
            if self.begin_failures > 0 {
                self.begin_failures -= 1;
                return Err(Error::ChipNotFound);
            }
            Ok(())
        }

        fn set_frequency(&mut self, _freq_mhz: f32) -> Result<(), Error> {
            Ok(())
        }

        fn set_bandwidth(&mut self, _bandwidth_khz: f32) -> Result<(), Error> {
            Ok(())
        }

        fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Error> {
            self.sf_calls.push(sf);
            if self.sf_failures.contains(&sf) {
                return Err(Error::InvalidSpreadingFactor);
            }
            self.current_sf = sf;
            Ok(())
        }

        fn set_coding_rate(&mut self, _coding_rate: u8) -> Result<(), Error> {
            Ok(())
        }

        fn set_sync_word(&mut self, _sync_word: u8) -> Result<(), Error> {
            Ok(())
        }

        fn set_preamble_length(&mut self, _preamble_length: u16) -> Result<(), Error> {
            Ok(())
        }

        fn set_output_power(&mut self, power_dbm: i8) -> Result<(), Error> {
            self.powers.push(power_dbm);
            Ok(())
        }

        fn set_current_limit(&mut self, _current_ma: u8) -> Result<(), Error> {
            Ok(())
        }

        fn set_crc(&mut self, _enable: bool) -> Result<(), Error> {
            Ok(())
        }

        fn invert_iq(&mut self, invert: bool) -> Result<(), Error> {
            self.iq.push(invert);
            Ok(())
        }

        fn output_power_range(&self) -> (i8, i8) {
            (2, 20)
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            self.receive_calls += 1;
            match &self.rx_result {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(*e),
                None => Err(Error::RxTimeout),
            }
        }

        fn scan_channel(&mut self) -> Result<bool, Error> {
            Ok(self.preamble_at_sf == Some(self.current_sf))
        }

        fn signal_quality(&mut self) -> Option<SignalQuality> {
            self.quality
        }

        fn configure_fsk(&mut self, bitrate_bps: u32, freq_dev_hz: u32) -> Result<(), Error> {
            self.fsk = Some((bitrate_bps, freq_dev_hz));
            Ok(())
        }

        fn transmit(&mut self, payload: &[u8]) -> Result<(), Error> {
            match self.tx_error {
                Some(e) => Err(e),
                None => {
                    self.transmitted.push(payload.to_vec());
                    Ok(())
                }
            }
        }

        fn micros(&self) -> u64 {
            self.clock_us
        }

        fn hold_until(&mut self, target_us: u64) {
            self.held_until.push(target_us);
            self.clock_us = self.clock_us.max(target_us);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockChip;
    use super::*;
    use crate::hal::loragw_com::tests::RegisterFile;

    fn settings(sf: SpreadingFactor) -> ChipSettings {
        ChipSettings {
            ic_model: String::from("SX1276"),
            spreading_factor: sf,
            carrier_frequency_mhz: 868.1,
            bandwidth_khz: 125.0,
            coding_rate: 5,
            sync_word: 0x34,
            preamble_length: 8,
            ..Default::default()
        }
    }

    fn lora_request(payload: Vec<u8>) -> DownlinkRequest {
        DownlinkRequest {
            send_immediately: false,
            target_unix_us: None,
            target_internal_us: Some(1_000_000),
            modulation: DownlinkModulation::Lora {
                sf: 9,
                bw_khz: 125.0,
                cr: 5,
            },
            frequency_mhz: 869.525,
            power_dbm: 27,
            preamble: 8,
            no_crc: true,
            invert_iq: true,
            payload,
        }
    }

    #[test]
    fn scan_stops_at_first_preamble() {
        let mut radio = MockChip {
            preamble_at_sf: Some(9),
            rx_result: Some(Ok(vec![0x40, 0x01, 0x02])),
            quality: Some(SignalQuality {
                rssi: -80.0,
                snr: 7.5,
                freq_error: 120.0,
            }),
            clock_us: 5_000,
            ..Default::default()
        };
        let stats = TrafficStats::new();
        let mut buf = [0u8; 256];

        let status = receive_uplink(&mut radio, &settings(SpreadingFactor::ScanAll), &stats, &mut buf);
        assert_eq!(radio.sf_calls, vec![7, 8, 9]);
        assert_eq!(radio.receive_calls, 1);

        match status {
            RecvStatus::Data(frame) => {
                assert_eq!(frame.spreading_factor, 9);
                assert_eq!(frame.payload, vec![0x40, 0x01, 0x02]);
                assert_eq!(frame.rssi, -80.0);
                assert_eq!(frame.freq_error, 120.0);
                assert_eq!(frame.timestamp_us, 5_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.recv_packets, 1);
        assert_eq!(snapshot.recv_packets_crc_good, 1);
    }

    #[test]
    fn scan_skips_spreading_factor_the_chip_refuses() {
        let mut radio = MockChip {
            preamble_at_sf: Some(9),
            sf_failures: vec![8],
            rx_result: Some(Ok(vec![0x80])),
            ..Default::default()
        };
        let stats = TrafficStats::new();
        let mut buf = [0u8; 256];

        match receive_uplink(&mut radio, &settings(SpreadingFactor::ScanAll), &stats, &mut buf) {
            RecvStatus::Data(frame) => assert_eq!(frame.spreading_factor, 9),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(radio.sf_calls, vec![7, 8, 9]);
        assert_eq!(radio.receive_calls, 1);
    }

    #[test]
    fn scan_without_preamble_is_no_data() {
        let mut radio = MockChip::default();
        let stats = TrafficStats::new();
        let mut buf = [0u8; 256];

        let status = receive_uplink(&mut radio, &settings(SpreadingFactor::ScanAll), &stats, &mut buf);
        assert_eq!(status, RecvStatus::NoData);
        assert_eq!(radio.sf_calls, vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(radio.receive_calls, 0);
        assert_eq!(stats.snapshot().recv_packets, 0);
    }

    #[test]
    fn failed_receive_after_preamble_is_reported() {
        let mut radio = MockChip {
            preamble_at_sf: Some(12),
            rx_result: Some(Err(Error::RxTimeout)),
            ..Default::default()
        };
        let stats = TrafficStats::new();
        let mut buf = [0u8; 256];

        let status = receive_uplink(&mut radio, &settings(SpreadingFactor::ScanAll), &stats, &mut buf);
        assert_eq!(status, RecvStatus::ReceiveFailed);
    }

    #[test]
    fn fixed_sf_receive_outcomes() {
        let stats = TrafficStats::new();
        let mut buf = [0u8; 256];

        let mut radio = MockChip::default();
        assert_eq!(
            receive_uplink(&mut radio, &settings(SpreadingFactor::Fixed(7)), &stats, &mut buf),
            RecvStatus::NoData
        );
        assert!(radio.sf_calls.is_empty());

        let mut radio = MockChip {
            rx_result: Some(Err(Error::CrcMismatch)),
            ..Default::default()
        };
        assert_eq!(
            receive_uplink(&mut radio, &settings(SpreadingFactor::Fixed(7)), &stats, &mut buf),
            RecvStatus::ReceiveFailed
        );
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.recv_packets, 1);
        assert_eq!(snapshot.recv_packets_crc_good, 0);
    }

    #[test]
    fn missing_quality_uses_sentinel() {
        let mut radio = MockChip {
            rx_result: Some(Ok(vec![1, 2, 3, 4])),
            ..Default::default()
        };
        let stats = TrafficStats::new();
        let mut buf = [0u8; 256];

        match receive_uplink(&mut radio, &settings(SpreadingFactor::Fixed(10)), &stats, &mut buf) {
            RecvStatus::Data(frame) => {
                assert_eq!(frame.rssi, 1.0);
                assert_eq!(frame.snr, 1.0);
                assert_eq!(frame.freq_error, 0.0);
                assert_eq!(frame.spreading_factor, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reconfigure_sequence() {
        let mut radio = MockChip::default();
        let mut conf = settings(SpreadingFactor::ScanAll);
        reconfigure(&mut radio, &conf).unwrap();
        assert_eq!(radio.resets, 0);
        assert_eq!(radio.sf_calls, vec![7]);
        assert_eq!(radio.powers, vec![17]);
        assert_eq!(radio.iq, vec![false]);

        conf.pin_rst = 3;
        reconfigure(&mut radio, &conf).unwrap();
        assert_eq!(radio.resets, 1);
    }

    #[test]
    fn restart_retries_until_success() {
        let conf = settings(SpreadingFactor::Fixed(7));

        let mut radio = MockChip {
            begin_failures: 3,
            ..Default::default()
        };
        assert!(restart_with_retries(&mut radio, &conf, 5));
        assert_eq!(radio.begins, 4);

        let mut radio = MockChip {
            begin_failures: 10,
            ..Default::default()
        };
        assert!(!restart_with_retries(&mut radio, &conf, 5));
        assert_eq!(radio.begins, 5);
    }

    #[test]
    fn transmit_holds_corrected_target_and_restores_rx() {
        let mut radio = MockChip::default();
        let conf = settings(SpreadingFactor::Fixed(7));
        let stats = TrafficStats::new();
        let request = lora_request(vec![0xAA; 12]);

        let outcome = transmit_downlink(&mut radio, &conf, &request, Some(1_000_000), &stats);
        assert_eq!(outcome.status, TxStatus::Sent);
        assert!(outcome.rx_restored);
        assert_eq!(radio.transmitted, vec![vec![0xAA; 12]]);

        let correction = tx_start_correction_us(&request, conf.spi_speed_hz) as u64;
        assert!(correction > 3536);
        assert_eq!(radio.held_until, vec![1_000_000 - correction]);

        /* power clamped to the chip range, then the receive default */
        assert_eq!(radio.powers, vec![20, 17]);
        assert_eq!(radio.iq, vec![true, false]);
        assert_eq!(radio.begins, 1);
        assert_eq!(stats.snapshot().downlink_transmitted, 1);
    }

    #[test]
    fn fsk_transmit_and_failure() {
        let conf = settings(SpreadingFactor::Fixed(7));
        let stats = TrafficStats::new();
        let mut request = lora_request(vec![1, 2]);
        request.modulation = DownlinkModulation::Fsk {
            datarate: 50000,
            freq_dev_hz: 25000,
        };

        let mut radio = MockChip::default();
        assert_eq!(transmit_downlink(&mut radio, &conf, &request, None, &stats).status, TxStatus::Sent);
        assert_eq!(radio.fsk, Some((50000, 25000)));
        assert!(radio.held_until.is_empty());

        let mut radio = MockChip {
            tx_error: Some(Error::TxTimeout),
            ..Default::default()
        };
        let outcome = transmit_downlink(&mut radio, &conf, &request, None, &stats);
        assert_eq!(outcome.status, TxStatus::Failed);
        /* receive mode is restored even after a failure */
        assert!(outcome.rx_restored);
        assert_eq!(radio.begins, 1);
        assert_eq!(stats.snapshot().downlink_transmitted, 1);
    }

    #[test]
    fn receive_mode_restore_is_retried() {
        let conf = settings(SpreadingFactor::Fixed(7));
        let stats = TrafficStats::new();
        let request = lora_request(vec![1, 2, 3]);

        let mut radio = MockChip {
            begin_failures: 1,
            ..Default::default()
        };
        let outcome = transmit_downlink(&mut radio, &conf, &request, None, &stats);
        assert_eq!(outcome.status, TxStatus::Sent);
        assert!(outcome.rx_restored);
        assert_eq!(radio.begins, 2);
    }

    #[test]
    fn exhausted_restore_is_recovered_by_restart() {
        let conf = settings(SpreadingFactor::Fixed(7));
        let stats = TrafficStats::new();
        let request = lora_request(vec![1, 2, 3]);
        let mut radio = MockChip {
            begin_failures: STARTUP_RESTART_ATTEMPTS as usize + 1,
            ..Default::default()
        };

        let outcome = transmit_downlink(&mut radio, &conf, &request, None, &stats);
        assert_eq!(outcome.status, TxStatus::Sent);
        assert!(!outcome.rx_restored);
        assert_eq!(radio.begins, STARTUP_RESTART_ATTEMPTS as usize);

        let keep_running = AtomicBool::new(true);
        let heartbeat = AtomicU64::new(0);
        assert!(recover_receive_mode(&mut radio, &conf, STARTUP_RESTART_ATTEMPTS, &keep_running, &heartbeat));
        assert_eq!(radio.begins, STARTUP_RESTART_ATTEMPTS as usize + 2);
        assert_eq!(heartbeat.load(Ordering::Relaxed), 1);

        let mut broken = MockChip {
            begin_failures: usize::MAX,
            ..Default::default()
        };
        keep_running.store(false, Ordering::Relaxed);
        assert!(!recover_receive_mode(&mut broken, &conf, 3, &keep_running, &heartbeat));
        assert_eq!(broken.begins, 0);
    }

    #[test]
    fn instantiate_from_registry() {
        let registry = ChipRegistry::<RegisterFile>::with_supported_chips();
        let conf = settings(SpreadingFactor::Fixed(7));
        let radio = instantiate_radio(&registry, RegisterFile::new(), &conf).unwrap();
        assert_eq!(radio.model(), "SX1276");

        let mut unknown = conf.clone();
        unknown.ic_model = String::from("SX9999");
        assert_eq!(
            instantiate_radio(&registry, RegisterFile::new(), &unknown).unwrap_err(),
            Error::UnknownChipModel
        );
    }
}
