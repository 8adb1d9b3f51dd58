pub mod error;
pub mod helper;
pub mod loragw_com;
pub mod loragw_sx126x;
pub mod loragw_sx127x;
pub mod loragw_timestamp;
mod loragw_usb_com;
pub mod mcu;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use error::Error;
use loragw_com::RadioCom;
use loragw_sx126x::Sx126x;
use loragw_sx127x::Sx127x;

pub use loragw_usb_com::UsbComPort;

pub const LGW_XTAL_FREQU: u32 = 32000000; /* frequency of the RF reference oscillator */
pub const LGW_MAX_PAYLOAD: usize = 256;   /* FIFO size of the supported transceivers */

/* values available for the 'bandwidth' parameters (LoRa) */
/* NOTE: these are the SX126x register codes, do not change */
pub const BW_UNDEFINED: u8 = 0;
pub const BW_500KHZ: u8 = 0x06;
pub const BW_250KHZ: u8 = 0x05;
pub const BW_125KHZ: u8 = 0x04;

/* values available for the 'datarate' parameters */
pub const DR_LORA_SF5: u32 = 5;
pub const DR_LORA_SF6: u32 = 6;
pub const DR_LORA_SF7: u32 = 7;
pub const DR_LORA_SF8: u32 = 8;
pub const DR_LORA_SF9: u32 = 9;
pub const DR_LORA_SF10: u32 = 10;
pub const DR_LORA_SF11: u32 = 11;
pub const DR_LORA_SF12: u32 = 12;

/* values available for the 'coderate' parameters (LoRa only) */
pub const CR_UNDEFINED: u8 = 0;
pub const CR_LORA_4_5: u8 = 0x01;
pub const CR_LORA_4_6: u8 = 0x02;
pub const CR_LORA_4_7: u8 = 0x03;
pub const CR_LORA_4_8: u8 = 0x04;

pub fn bw_from_khz(bandwidth_khz: f32) -> u8 {
    match bandwidth_khz as u32 {
        125 => BW_125KHZ,
        250 => BW_250KHZ,
        500 => BW_500KHZ,
        _ => BW_UNDEFINED,
    }
}

/// Coding rate denominator (5 for 4/5 ... 8 for 4/8) to its `CR_LORA_*` code.
pub fn cr_from_denominator(coding_rate: u8) -> u8 {
    match coding_rate {
        5..=8 => coding_rate - 4,
        _ => CR_UNDEFINED,
    }
}

pub fn is_lora_bw(bw: u8) -> bool {
    matches!(bw, BW_125KHZ | BW_250KHZ | BW_500KHZ)
}

pub fn is_lora_dr(dr: u32) -> bool {
    (DR_LORA_SF5..=DR_LORA_SF12).contains(&dr)
}

pub fn is_lora_cr(cr: u8) -> bool {
    (CR_LORA_4_5..=CR_LORA_4_8).contains(&cr)
}

/// Low data rate optimisation, mandated when a symbol lasts 16 ms or more.
pub fn is_ppm_on(bw: u8, dr: u32) -> bool {
    ((bw == BW_125KHZ) && ((dr == DR_LORA_SF11) || (dr == DR_LORA_SF12))) || ((bw == BW_250KHZ) && (dr == DR_LORA_SF12))
}

/// Spreading factor setting: one fixed value, or a preamble scan over SF7..SF12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadingFactor {
    Fixed(u8),
    ScanAll,
}

impl SpreadingFactor {
    pub const SCAN_MIN: u8 = 7;
    pub const SCAN_MAX: u8 = 12;

    /// Value programmed at restart; scan mode starts from the lowest factor.
    pub fn initial(&self) -> u8 {
        match self {
            SpreadingFactor::Fixed(sf) => *sf,
            SpreadingFactor::ScanAll => Self::SCAN_MIN,
        }
    }
}

impl std::fmt::Display for SpreadingFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpreadingFactor::Fixed(sf) => write!(f, "SF{}", sf),
            SpreadingFactor::ScanAll => write!(f, "SF{}..SF{} (scan)", Self::SCAN_MIN, Self::SCAN_MAX),
        }
    }
}

mod spreading_factor_serde {
    use std::fmt;

    use serde::de;
    use serde::{Deserializer, Serializer};
    use tracing::warn;

    use super::SpreadingFactor;

    const SF_MIN: i64 = 6;
    const SF_MAX: i64 = 12;
    const SF_ALL: i64 = -1;
    const SF_FALLBACK: u8 = 7;

    pub fn serialize<S>(value: &SpreadingFactor, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            SpreadingFactor::Fixed(sf) => serializer.serialize_i64(*sf as i64),
            SpreadingFactor::ScanAll => serializer.serialize_i64(SF_ALL),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SpreadingFactor, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SpreadingFactorVisitor;

        impl<'de> de::Visitor<'de> for SpreadingFactorVisitor {
            type Value = SpreadingFactor;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a spreading factor between 6 and 12, or -1 / \"all\" to scan")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    SF_ALL => Ok(SpreadingFactor::ScanAll),
                    SF_MIN..=SF_MAX => Ok(SpreadingFactor::Fixed(value as u8)),
                    _ => {
                        warn!("WARNING: spreading factor {} out of range, using SF{}", value, SF_FALLBACK);
                        Ok(SpreadingFactor::Fixed(SF_FALLBACK))
                    }
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_i64(value.min(i64::MAX as u64) as i64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value.eq_ignore_ascii_case("all") {
                    return Ok(SpreadingFactor::ScanAll);
                }
                let sf = value
                    .trim_start_matches(|c| c == 'S' || c == 's' || c == 'F' || c == 'f')
                    .parse::<i64>()
                    .map_err(|_| de::Error::custom(format!("Invalid spreading factor: {}", value)))?;
                self.visit_i64(sf)
            }
        }

        deserializer.deserialize_any(SpreadingFactorVisitor)
    }
}

/**
@struct ChipSettings
@brief Static configuration of the single radio: model, bus, pins and RF parameters
*/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipSettings {
    pub ic_model: String,
    #[serde(default)]
    pub spi_channel: u8,
    #[serde(default = "default_spi_speed_hz")]
    pub spi_speed_hz: u32,

    #[serde(default = "default_unused_pin")]
    pub pin_nss_cs: i32,
    #[serde(default = "default_unused_pin")]
    pub pin_dio0: i32,
    #[serde(default = "default_unused_pin")]
    pub pin_dio1: i32,
    #[serde(default = "default_unused_pin", alias = "pin_rest")]
    pub pin_rst: i32, /* -1 means not wired */

    #[serde(with = "spreading_factor_serde")]
    pub spreading_factor: SpreadingFactor,
    pub carrier_frequency_mhz: f32,
    pub bandwidth_khz: f32,
    pub coding_rate: u8, /* denominator of 4/x */
    pub sync_word: u8,
    pub preamble_length: u16,
}

fn default_spi_speed_hz() -> u32 {
    500000
}

fn default_unused_pin() -> i32 {
    -1
}

impl Default for ChipSettings {
    fn default() -> Self {
        Self {
            ic_model: String::from("SX1276"),
            spi_channel: 0,
            spi_speed_hz: default_spi_speed_hz(),
            pin_nss_cs: -1,
            pin_dio0: -1,
            pin_dio1: -1,
            pin_rst: -1,
            spreading_factor: SpreadingFactor::Fixed(7),
            carrier_frequency_mhz: 868.1,
            bandwidth_khz: 125.0,
            coding_rate: 5,
            sync_word: 0x34,
            preamble_length: 8,
        }
    }
}

impl std::fmt::Display for ChipSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {{ spi: {}@{}Hz, pins: nss_cs={} dio0={} dio1={} rst={}, freq: {} MHz, bw: {} kHz, {}, cr: 4/{}, sync_word: 0x{:02X}, preamble: {} }}",
            self.ic_model,
            self.spi_channel,
            self.spi_speed_hz,
            self.pin_nss_cs,
            self.pin_dio0,
            self.pin_dio1,
            self.pin_rst,
            self.carrier_frequency_mhz,
            self.bandwidth_khz,
            self.spreading_factor,
            self.coding_rate,
            self.sync_word,
            self.preamble_length
        )
    }
}

/// Which quality metrics a driver family can read back after a reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    WithFrequencyError,
    WithoutFrequencyError,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalQuality {
    pub rssi: f32,       /* dBm */
    pub snr: f32,        /* dB */
    pub freq_error: f32, /* Hz */
}

impl SignalQuality {
    /// Reported when the chip cannot tell; forwarding goes on regardless.
    pub const SENTINEL: SignalQuality = SignalQuality {
        rssi: 1.0,
        snr: 1.0,
        freq_error: 0.0,
    };
}

/// Capability set every supported transceiver exposes to the control loop.
///
/// Status codes follow [`Error`]; receive reports a timeout or a CRC failure
/// as an error so the caller can tell them apart from a frame.
pub trait RadioDriver {
    fn model(&self) -> &str;
    fn family(&self) -> ChipFamily;

    /// Pulses the hardware reset line.
    fn reset(&mut self) -> Result<(), Error>;

    /// Probes the chip and puts it in LoRa standby.
    fn begin(&mut self) -> Result<(), Error>;

    fn set_frequency(&mut self, freq_mhz: f32) -> Result<(), Error>;
    fn set_bandwidth(&mut self, bandwidth_khz: f32) -> Result<(), Error>;
    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Error>;
    fn set_coding_rate(&mut self, coding_rate: u8) -> Result<(), Error>;
    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), Error>;
    fn set_preamble_length(&mut self, preamble_length: u16) -> Result<(), Error>;
    fn set_output_power(&mut self, power_dbm: i8) -> Result<(), Error>;
    fn set_current_limit(&mut self, current_ma: u8) -> Result<(), Error>;
    fn set_crc(&mut self, enable: bool) -> Result<(), Error>;
    fn invert_iq(&mut self, invert: bool) -> Result<(), Error>;

    /// Output power range accepted by [`RadioDriver::set_output_power`].
    fn output_power_range(&self) -> (i8, i8);

    /// Blocking single reception into `buf`, returns the payload length.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Channel activity detection at the current settings; `true` on preamble.
    fn scan_channel(&mut self) -> Result<bool, Error>;

    /// Metrics of the last received frame.
    fn signal_quality(&mut self) -> Option<SignalQuality>;

    /// Leaves LoRa mode for an FSK transmission; the next `begin` restores LoRa.
    fn configure_fsk(&mut self, bitrate_bps: u32, freq_dev_hz: u32) -> Result<(), Error>;

    fn transmit(&mut self, payload: &[u8]) -> Result<(), Error>;

    fn micros(&self) -> u64;

    /// Returns once the local clock reaches `target_us`.
    ///
    /// Sleeps coarsely until the last few milliseconds, then spins.
    fn hold_until(&mut self, target_us: u64) {
        const SPIN_WINDOW_US: u64 = 3000;

        loop {
            let now = self.micros();
            if now >= target_us {
                return;
            }
            let remaining = target_us - now;
            if remaining > SPIN_WINDOW_US {
                helper::wait_us(remaining - SPIN_WINDOW_US);
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// The transceivers this gateway can drive, tagged by driver family.
#[derive(Debug)]
pub enum LoraChip<C> {
    Sx127x(Sx127x<C>),
    Sx126x(Sx126x<C>),
}

macro_rules! dispatch {
    ($self:expr, $chip:ident => $call:expr) => {
        match $self {
            LoraChip::Sx127x($chip) => $call,
            LoraChip::Sx126x($chip) => $call,
        }
    };
}

impl<C: RadioCom> RadioDriver for LoraChip<C> {
    fn model(&self) -> &str {
        dispatch!(self, chip => chip.model())
    }

    fn family(&self) -> ChipFamily {
        dispatch!(self, chip => chip.family())
    }

    fn reset(&mut self) -> Result<(), Error> {
        dispatch!(self, chip => chip.reset())
    }

    fn begin(&mut self) -> Result<(), Error> {
        dispatch!(self, chip => chip.begin())
    }

    fn set_frequency(&mut self, freq_mhz: f32) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_frequency(freq_mhz))
    }

    fn set_bandwidth(&mut self, bandwidth_khz: f32) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_bandwidth(bandwidth_khz))
    }

    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_spreading_factor(sf))
    }

    fn set_coding_rate(&mut self, coding_rate: u8) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_coding_rate(coding_rate))
    }

    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_sync_word(sync_word))
    }

    fn set_preamble_length(&mut self, preamble_length: u16) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_preamble_length(preamble_length))
    }

    fn set_output_power(&mut self, power_dbm: i8) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_output_power(power_dbm))
    }

    fn set_current_limit(&mut self, current_ma: u8) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_current_limit(current_ma))
    }

    fn set_crc(&mut self, enable: bool) -> Result<(), Error> {
        dispatch!(self, chip => chip.set_crc(enable))
    }

    fn invert_iq(&mut self, invert: bool) -> Result<(), Error> {
        dispatch!(self, chip => chip.invert_iq(invert))
    }

    fn output_power_range(&self) -> (i8, i8) {
        dispatch!(self, chip => chip.output_power_range())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        dispatch!(self, chip => chip.receive(buf))
    }

    fn scan_channel(&mut self) -> Result<bool, Error> {
        dispatch!(self, chip => chip.scan_channel())
    }

    fn signal_quality(&mut self) -> Option<SignalQuality> {
        dispatch!(self, chip => chip.signal_quality())
    }

    fn configure_fsk(&mut self, bitrate_bps: u32, freq_dev_hz: u32) -> Result<(), Error> {
        dispatch!(self, chip => chip.configure_fsk(bitrate_bps, freq_dev_hz))
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<(), Error> {
        dispatch!(self, chip => chip.transmit(payload))
    }

    fn micros(&self) -> u64 {
        dispatch!(self, chip => chip.micros())
    }
}

pub type ChipConstructor<C> = Box<dyn Fn(C) -> LoraChip<C>>;

/// Model name to driver constructor table, built once at start-up.
pub struct ChipRegistry<C> {
    constructors: BTreeMap<String, ChipConstructor<C>>,
}

impl<C: RadioCom + 'static> ChipRegistry<C> {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, model: &str, constructor: F)
    where
        F: Fn(C) -> LoraChip<C> + 'static,
    {
        self.constructors.insert(model.to_ascii_uppercase(), Box::new(constructor));
    }

    pub fn with_supported_chips() -> Self {
        let mut registry = Self::new();
        loragw_sx127x::register_variants(&mut registry);
        loragw_sx126x::register_variants(&mut registry);
        registry
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|k| k.as_str())
    }

    pub fn contains(&self, model: &str) -> bool {
        self.constructors.contains_key(&model.to_ascii_uppercase())
    }

    pub fn instantiate(&self, model: &str, com: C) -> Result<LoraChip<C>, Error> {
        let constructor = self
            .constructors
            .get(&model.to_ascii_uppercase())
            .ok_or(Error::UnknownChipModel)?;
        Ok(constructor(com))
    }
}

impl<C: RadioCom + 'static> Default for ChipRegistry<C> {
    fn default() -> Self {
        Self::with_supported_chips()
    }
}
