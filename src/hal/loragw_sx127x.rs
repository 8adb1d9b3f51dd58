use tracing::{debug, error, trace};

use super::error::Error;
use super::loragw_com::{LoragwComTrait, RadioCom};
use super::loragw_timestamp::lora_packet_time_on_air;
use super::{bw_from_khz, cr_from_denominator, ChipFamily, ChipRegistry, LoraChip, RadioDriver, SignalQuality, LGW_XTAL_FREQU};

/* -------------------------------------------------------------------------- */
/* --- REGISTERS ------------------------------------------------------------ */

const REG_FIFO: u8 = 0x00;
const REG_OP_MODE: u8 = 0x01;
const REG_FRF_MSB: u8 = 0x06;
const REG_PA_CONFIG: u8 = 0x09;
const REG_OCP: u8 = 0x0B;
const REG_LNA: u8 = 0x0C;
const REG_FIFO_ADDR_PTR: u8 = 0x0D;
const REG_FIFO_TX_BASE_ADDR: u8 = 0x0E;
const REG_FIFO_RX_BASE_ADDR: u8 = 0x0F;
const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
const REG_IRQ_FLAGS: u8 = 0x12;
const REG_RX_NB_BYTES: u8 = 0x13;
const REG_PKT_SNR_VALUE: u8 = 0x19;
const REG_PKT_RSSI_VALUE: u8 = 0x1A;
const REG_MODEM_CONFIG_1: u8 = 0x1D;
const REG_MODEM_CONFIG_2: u8 = 0x1E;
const REG_SYMB_TIMEOUT_LSB: u8 = 0x1F;
const REG_PREAMBLE_MSB: u8 = 0x20;
const REG_PAYLOAD_LENGTH: u8 = 0x22;
const REG_MODEM_CONFIG_3: u8 = 0x26;
const REG_FEI_MSB: u8 = 0x28;
const REG_DETECT_OPTIMIZE: u8 = 0x31;
const REG_INVERT_IQ: u8 = 0x33;
const REG_DETECTION_THRESHOLD: u8 = 0x37;
const REG_SYNC_WORD: u8 = 0x39;
const REG_INVERT_IQ2: u8 = 0x3B;
const REG_VERSION: u8 = 0x42;

/* FSK page, valid only while LongRangeMode is cleared */
const REG_FSK_BITRATE_MSB: u8 = 0x02;
const REG_FSK_FDEV_MSB: u8 = 0x04;
const REG_FSK_PREAMBLE_MSB: u8 = 0x25;
const REG_FSK_SYNC_CONFIG: u8 = 0x27;
const REG_FSK_SYNC_VALUE_1: u8 = 0x28;
const REG_FSK_PACKET_CONFIG_1: u8 = 0x30;
const REG_FSK_PAYLOAD_LENGTH: u8 = 0x32;
const REG_FSK_IRQ_FLAGS_2: u8 = 0x3F;

const LONG_RANGE_MODE: u8 = 0x80;
const MODE_SLEEP: u8 = 0x00;
const MODE_STDBY: u8 = 0x01;
const MODE_TX: u8 = 0x03;
const MODE_RXSINGLE: u8 = 0x06;
const MODE_CAD: u8 = 0x07;

const IRQ_RX_TIMEOUT: u8 = 0x80;
const IRQ_RX_DONE: u8 = 0x40;
const IRQ_PAYLOAD_CRC_ERROR: u8 = 0x20;
const IRQ_TX_DONE: u8 = 0x08;
const IRQ_CAD_DONE: u8 = 0x04;
const IRQ_CAD_DETECTED: u8 = 0x01;
const IRQ_FSK_PACKET_SENT: u8 = 0x08;

const RX_SYMBOL_TIMEOUT: u8 = 100;
const VERSION_READ_ATTEMPTS: u32 = 10;
const DEFAULT_TX_TIMEOUT_US: u64 = 5_000_000;

/* -------------------------------------------------------------------------- */
/* --- VARIANTS ------------------------------------------------------------- */

/// Register layout of the modem configuration, the two generations differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterLayout {
    Sx1272,
    Sx1276,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipVariant {
    pub name: &'static str,
    pub version: u8,
    pub freq_min_mhz: f32,
    pub freq_max_mhz: f32,
    pub max_sf: u8,
    pub layout: RegisterLayout,
    reg_pa_dac: u8,
}

const REG_PA_DAC_SX1272: u8 = 0x5A;
const REG_PA_DAC_SX1276: u8 = 0x4D;

macro_rules! variant {
    ($name:ident, $version:expr, $min:expr, $max:expr, $sf:expr, Sx1272) => {
        pub const $name: ChipVariant = ChipVariant {
            name: stringify!($name),
            version: $version,
            freq_min_mhz: $min,
            freq_max_mhz: $max,
            max_sf: $sf,
            layout: RegisterLayout::Sx1272,
            reg_pa_dac: REG_PA_DAC_SX1272,
        };
    };
    ($name:ident, $version:expr, $min:expr, $max:expr, $sf:expr, Sx1276) => {
        pub const $name: ChipVariant = ChipVariant {
            name: stringify!($name),
            version: $version,
            freq_min_mhz: $min,
            freq_max_mhz: $max,
            max_sf: $sf,
            layout: RegisterLayout::Sx1276,
            reg_pa_dac: REG_PA_DAC_SX1276,
        };
    };
}

variant!(SX1272, 0x22, 860.0, 1020.0, 12, Sx1272);
variant!(SX1273, 0x22, 860.0, 1020.0, 9, Sx1272);
variant!(SX1276, 0x12, 137.0, 1020.0, 12, Sx1276);
variant!(SX1277, 0x12, 137.0, 1020.0, 9, Sx1276);
variant!(SX1278, 0x12, 137.0, 525.0, 12, Sx1276);
variant!(SX1279, 0x12, 137.0, 960.0, 12, Sx1276);
variant!(RFM95, 0x12, 862.0, 1020.0, 12, Sx1276);
variant!(RFM96, 0x12, 410.0, 525.0, 12, Sx1276);
variant!(RFM97, 0x12, 862.0, 1020.0, 9, Sx1276);

pub static VARIANTS: [ChipVariant; 9] = [SX1272, SX1273, SX1276, SX1277, SX1278, SX1279, RFM95, RFM96, RFM97];

pub fn register_variants<C: RadioCom + 'static>(registry: &mut ChipRegistry<C>) {
    for variant in VARIANTS.iter() {
        registry.register(variant.name, move |com| LoraChip::Sx127x(Sx127x::new(com, variant)));
    }
    /* RFM98 is an RFM96 in a different package */
    registry.register("RFM98", |com| LoraChip::Sx127x(Sx127x::new(com, &RFM96)));
}

/* -------------------------------------------------------------------------- */
/* --- DRIVER --------------------------------------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modem {
    Lora,
    Fsk,
}

#[derive(Debug)]
pub struct Sx127x<C> {
    com: C,
    variant: &'static ChipVariant,
    modem: Modem,
    freq_mhz: f32,
    bandwidth_khz: f32,
    sf: u8,
    coding_rate: u8,
    preamble_length: u16,
    crc: bool,
}

impl<C: RadioCom> Sx127x<C> {
    pub fn new(com: C, variant: &'static ChipVariant) -> Self {
        Self {
            com,
            variant,
            modem: Modem::Lora,
            freq_mhz: 0.0,
            bandwidth_khz: 125.0,
            sf: 9,
            coding_rate: 7,
            preamble_length: 8,
            crc: true,
        }
    }

    pub fn variant(&self) -> &ChipVariant {
        self.variant
    }

    pub fn com(&mut self) -> &mut C {
        &mut self.com
    }

    fn r(&mut self, address: u8) -> Result<u8, Error> {
        self.com.lgw_com_r(address).map_err(|e| {
            error!("ERROR: {} read of register 0x{:02X} failed: {}", self.variant.name, address, e);
            Error::SpiWriteFailed
        })
    }

    fn w(&mut self, address: u8, value: u8) -> Result<(), Error> {
        self.com.lgw_com_w(address, value).map_err(|e| {
            error!("ERROR: {} write of register 0x{:02X} failed: {}", self.variant.name, address, e);
            Error::SpiWriteFailed
        })
    }

    fn rmw(&mut self, address: u8, offs: u8, leng: u8, value: u8) -> Result<(), Error> {
        self.com.lgw_com_rmw(address, offs, leng, value).map_err(|e| {
            error!("ERROR: {} update of register 0x{:02X} failed: {}", self.variant.name, address, e);
            Error::SpiWriteFailed
        })
    }

    fn rb(&mut self, address: u8, data: &mut [u8]) -> Result<(), Error> {
        self.com.lgw_com_rb(address, data).map_err(|_| Error::SpiWriteFailed)
    }

    fn wb(&mut self, address: u8, data: &[u8]) -> Result<(), Error> {
        self.com.lgw_com_wb(address, data).map_err(|_| Error::SpiWriteFailed)
    }

    fn set_mode(&mut self, mode: u8) -> Result<(), Error> {
        self.rmw(REG_OP_MODE, 0, 3, mode)
    }

    fn standby(&mut self) -> Result<(), Error> {
        self.set_mode(MODE_STDBY)
    }

    fn clear_irq(&mut self) -> Result<(), Error> {
        self.w(REG_IRQ_FLAGS, 0xFF)
    }

    /* Polls `reg` until one of `mask` is raised or the deadline passes */
    fn wait_irq(&mut self, reg: u8, mask: u8, timeout_us: u64) -> Result<Option<u8>, Error> {
        let start = self.com.micros();
        loop {
            let flags = self.r(reg)?;
            if flags & mask != 0 {
                return Ok(Some(flags));
            }
            if self.com.micros().saturating_sub(start) > timeout_us {
                return Ok(None);
            }
            self.com.delay_ms(1);
        }
    }

    fn symbol_us(&self) -> u64 {
        ((1u64 << self.sf) as f64 * 1000.0 / self.bandwidth_khz as f64) as u64
    }

    /* Longest packet the modem may be busy with, plus the symbol timeout */
    fn max_packet_us(&self, size: u8) -> u64 {
        let bw = bw_from_khz(self.bandwidth_khz);
        let cr = cr_from_denominator(self.coding_rate);
        match lora_packet_time_on_air(bw, self.sf, cr, self.preamble_length, false, !self.crc, size) {
            Ok((toa_us, _, _, _)) => toa_us as u64,
            Err(_) => self.symbol_us() * (self.preamble_length as u64 + 8 + 2 * size as u64 + 20),
        }
    }

    fn update_low_data_rate_optimize(&mut self) -> Result<(), Error> {
        let symbol_ms = (1u32 << self.sf) as f32 / self.bandwidth_khz;
        let ldro = if symbol_ms >= 16.0 { 1 } else { 0 };
        match self.variant.layout {
            RegisterLayout::Sx1272 => self.rmw(REG_MODEM_CONFIG_1, 0, 1, ldro),
            RegisterLayout::Sx1276 => self.rmw(REG_MODEM_CONFIG_3, 3, 1, ldro),
        }
    }

    fn sx1276_bw_code(bandwidth_khz: f32) -> Option<u8> {
        const TABLE: [(f32, u8); 10] = [
            (7.8, 0),
            (10.4, 1),
            (15.6, 2),
            (20.8, 3),
            (31.25, 4),
            (41.7, 5),
            (62.5, 6),
            (125.0, 7),
            (250.0, 8),
            (500.0, 9),
        ];
        TABLE
            .iter()
            .find(|(bw, _)| libm::fabsf(bandwidth_khz - bw) <= 0.001)
            .map(|(_, code)| *code)
    }

    fn rssi_offset(&self) -> f32 {
        match self.variant.layout {
            RegisterLayout::Sx1272 => -139.0,
            RegisterLayout::Sx1276 if self.freq_mhz < 779.0 => -164.0,
            RegisterLayout::Sx1276 => -157.0,
        }
    }

    fn read_frequency_error(&mut self) -> Result<f32, Error> {
        let mut fei = [0u8; 3];
        self.rb(REG_FEI_MSB, &mut fei)?;
        let raw = (((fei[0] & 0x0F) as i32) << 16) | ((fei[1] as i32) << 8) | fei[2] as i32;
        /* sign extend the 20-bit value */
        let raw = if raw & 0x80000 != 0 { raw - 0x100000 } else { raw };
        let factor = (1u32 << 24) as f32 / LGW_XTAL_FREQU as f32;
        Ok(raw as f32 * factor * (self.bandwidth_khz / 500.0))
    }

    fn transmit_lora(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.w(REG_FIFO_TX_BASE_ADDR, 0x00)?;
        self.w(REG_FIFO_ADDR_PTR, 0x00)?;
        self.w(REG_PAYLOAD_LENGTH, payload.len() as u8)?;
        if !payload.is_empty() {
            self.wb(REG_FIFO, payload)?;
        }
        self.clear_irq()?;
        self.set_mode(MODE_TX)?;

        let timeout_us = self.max_packet_us(payload.len() as u8) * 5 / 4 + 100_000;
        let done = self.wait_irq(REG_IRQ_FLAGS, IRQ_TX_DONE, timeout_us)?;
        self.clear_irq()?;
        self.standby()?;
        match done {
            Some(_) => Ok(()),
            None => Err(Error::TxTimeout),
        }
    }

    fn transmit_fsk(&mut self, payload: &[u8]) -> Result<(), Error> {
        /* variable length packet: length byte first */
        self.w(REG_FSK_PAYLOAD_LENGTH, payload.len() as u8)?;
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);
        self.wb(REG_FIFO, &frame)?;
        self.set_mode(MODE_TX)?;

        let done = self.wait_irq(REG_FSK_IRQ_FLAGS_2, IRQ_FSK_PACKET_SENT, DEFAULT_TX_TIMEOUT_US)?;
        self.standby()?;
        match done {
            Some(_) => Ok(()),
            None => Err(Error::TxTimeout),
        }
    }
}

impl<C: RadioCom> RadioDriver for Sx127x<C> {
    fn model(&self) -> &str {
        self.variant.name
    }

    fn family(&self) -> ChipFamily {
        ChipFamily::WithFrequencyError
    }

    fn reset(&mut self) -> Result<(), Error> {
        let name = self.variant.name;
        let pulse = |com: &mut C, active: bool| {
            com.set_reset(active).map_err(|e| {
                error!("ERROR: {} reset line: {}", name, e);
                Error::SpiWriteFailed
            })
        };
        pulse(&mut self.com, true)?;
        self.com.delay_ms(1);
        pulse(&mut self.com, false)?;
        self.com.delay_ms(5);
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        let mut version = 0;
        for _ in 0..VERSION_READ_ATTEMPTS {
            version = self.r(REG_VERSION)?;
            if version == self.variant.version {
                break;
            }
            self.com.delay_ms(10);
        }
        if version != self.variant.version {
            error!(
                "ERROR: {} not found (version 0x{:02X}, expected 0x{:02X})",
                self.variant.name, version, self.variant.version
            );
            return Err(Error::ChipNotFound);
        }
        debug!("{} found, silicon version 0x{:02X}", self.variant.name, version);

        /* LongRangeMode can only change in sleep */
        self.w(REG_OP_MODE, MODE_SLEEP)?;
        self.w(REG_OP_MODE, LONG_RANGE_MODE | MODE_SLEEP)?;
        self.w(REG_OP_MODE, LONG_RANGE_MODE | MODE_STDBY)?;
        self.modem = Modem::Lora;

        self.w(REG_FIFO_TX_BASE_ADDR, 0x00)?;
        self.w(REG_FIFO_RX_BASE_ADDR, 0x00)?;
        self.w(REG_LNA, 0x23)?; /* max gain, boost on */
        match self.variant.layout {
            RegisterLayout::Sx1272 => self.rmw(REG_MODEM_CONFIG_2, 2, 1, 1)?,
            RegisterLayout::Sx1276 => self.rmw(REG_MODEM_CONFIG_3, 2, 1, 1)?,
        }
        Ok(())
    }

    fn set_frequency(&mut self, freq_mhz: f32) -> Result<(), Error> {
        if freq_mhz < self.variant.freq_min_mhz || freq_mhz > self.variant.freq_max_mhz {
            return Err(Error::InvalidFrequency);
        }
        self.standby()?;
        let frf = (freq_mhz as f64 * (1u64 << 19) as f64 / (LGW_XTAL_FREQU as f64 / 1e6)) as u32;
        self.wb(REG_FRF_MSB, &[(frf >> 16) as u8, (frf >> 8) as u8, frf as u8])?;
        self.freq_mhz = freq_mhz;
        Ok(())
    }

    fn set_bandwidth(&mut self, bandwidth_khz: f32) -> Result<(), Error> {
        self.standby()?;
        match self.variant.layout {
            RegisterLayout::Sx1272 => {
                let code = match bw_from_khz(bandwidth_khz) {
                    super::BW_125KHZ => 0,
                    super::BW_250KHZ => 1,
                    super::BW_500KHZ => 2,
                    _ => return Err(Error::InvalidBandwidth),
                };
                self.rmw(REG_MODEM_CONFIG_1, 6, 2, code)?;
            }
            RegisterLayout::Sx1276 => {
                let code = Self::sx1276_bw_code(bandwidth_khz).ok_or(Error::InvalidBandwidth)?;
                self.rmw(REG_MODEM_CONFIG_1, 4, 4, code)?;
            }
        }
        self.bandwidth_khz = bandwidth_khz;
        self.update_low_data_rate_optimize()
    }

    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Error> {
        if sf < 6 || sf > self.variant.max_sf {
            return Err(Error::InvalidSpreadingFactor);
        }
        self.standby()?;
        self.rmw(REG_MODEM_CONFIG_2, 4, 4, sf)?;
        if sf == 6 {
            self.rmw(REG_DETECT_OPTIMIZE, 0, 3, 0x05)?;
            self.w(REG_DETECTION_THRESHOLD, 0x0C)?;
        } else {
            self.rmw(REG_DETECT_OPTIMIZE, 0, 3, 0x03)?;
            self.w(REG_DETECTION_THRESHOLD, 0x0A)?;
        }
        self.sf = sf;
        self.update_low_data_rate_optimize()
    }

    fn set_coding_rate(&mut self, coding_rate: u8) -> Result<(), Error> {
        if !(5..=8).contains(&coding_rate) {
            return Err(Error::InvalidCodingRate);
        }
        self.standby()?;
        match self.variant.layout {
            RegisterLayout::Sx1272 => self.rmw(REG_MODEM_CONFIG_1, 3, 3, coding_rate - 4)?,
            RegisterLayout::Sx1276 => self.rmw(REG_MODEM_CONFIG_1, 1, 3, coding_rate - 4)?,
        }
        self.coding_rate = coding_rate;
        Ok(())
    }

    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), Error> {
        self.standby()?;
        self.w(REG_SYNC_WORD, sync_word)
    }

    fn set_preamble_length(&mut self, preamble_length: u16) -> Result<(), Error> {
        if preamble_length < 6 {
            return Err(Error::InvalidPreambleLength);
        }
        self.standby()?;
        let reg = match self.modem {
            Modem::Lora => REG_PREAMBLE_MSB,
            Modem::Fsk => REG_FSK_PREAMBLE_MSB,
        };
        self.wb(reg, &preamble_length.to_be_bytes())?;
        self.preamble_length = preamble_length;
        Ok(())
    }

    /* PA_BOOST output only; the high power DAC covers 18..20 dBm */
    fn set_output_power(&mut self, power_dbm: i8) -> Result<(), Error> {
        let (min, max) = self.output_power_range();
        if power_dbm < min || power_dbm > max {
            return Err(Error::InvalidOutputPower);
        }
        self.standby()?;
        let reg_pa_dac = self.variant.reg_pa_dac;
        if power_dbm <= 17 {
            self.w(REG_PA_CONFIG, 0x80 | (power_dbm - 2) as u8)?;
            self.w(reg_pa_dac, 0x84)
        } else {
            self.w(REG_PA_CONFIG, 0x80 | (power_dbm - 5) as u8)?;
            self.w(reg_pa_dac, 0x87)
        }
    }

    fn output_power_range(&self) -> (i8, i8) {
        (2, 20)
    }

    fn set_current_limit(&mut self, current_ma: u8) -> Result<(), Error> {
        let raw = match current_ma {
            45..=120 => (current_ma - 45) / 5,
            121..=240 => ((current_ma as u16 + 30) / 10) as u8,
            _ => return Err(Error::InvalidCurrentLimit),
        };
        self.standby()?;
        self.w(REG_OCP, 0x20 | raw)
    }

    fn set_crc(&mut self, enable: bool) -> Result<(), Error> {
        self.standby()?;
        match (self.modem, self.variant.layout) {
            (Modem::Fsk, _) => self.rmw(REG_FSK_PACKET_CONFIG_1, 4, 1, enable as u8)?,
            (Modem::Lora, RegisterLayout::Sx1272) => self.rmw(REG_MODEM_CONFIG_1, 1, 1, enable as u8)?,
            (Modem::Lora, RegisterLayout::Sx1276) => self.rmw(REG_MODEM_CONFIG_2, 2, 1, enable as u8)?,
        }
        self.crc = enable;
        Ok(())
    }

    fn invert_iq(&mut self, invert: bool) -> Result<(), Error> {
        if self.modem == Modem::Fsk {
            return Ok(());
        }
        self.standby()?;
        self.rmw(REG_INVERT_IQ, 6, 1, invert as u8)?;
        self.rmw(REG_INVERT_IQ, 0, 1, !invert as u8)?;
        self.w(REG_INVERT_IQ2, if invert { 0x19 } else { 0x1D })
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.standby()?;
        self.w(REG_FIFO_RX_BASE_ADDR, 0x00)?;
        self.w(REG_FIFO_ADDR_PTR, 0x00)?;
        self.rmw(REG_MODEM_CONFIG_2, 0, 2, 0)?;
        self.w(REG_SYMB_TIMEOUT_LSB, RX_SYMBOL_TIMEOUT)?;
        self.clear_irq()?;
        self.set_mode(MODE_RXSINGLE)?;

        let timeout_us = self.symbol_us() * RX_SYMBOL_TIMEOUT as u64 + self.max_packet_us(u8::MAX);
        let flags = self.wait_irq(REG_IRQ_FLAGS, IRQ_RX_DONE | IRQ_RX_TIMEOUT, timeout_us)?;

        let flags = match flags {
            Some(flags) if flags & IRQ_RX_DONE != 0 => flags,
            _ => {
                self.clear_irq()?;
                self.standby()?;
                return Err(Error::RxTimeout);
            }
        };

        if flags & IRQ_PAYLOAD_CRC_ERROR != 0 {
            self.clear_irq()?;
            self.standby()?;
            return Err(Error::CrcMismatch);
        }

        let nb_bytes = self.r(REG_RX_NB_BYTES)? as usize;
        let current = self.r(REG_FIFO_RX_CURRENT_ADDR)?;
        self.w(REG_FIFO_ADDR_PTR, current)?;
        let size = nb_bytes.min(buf.len());
        if size > 0 {
            self.rb(REG_FIFO, &mut buf[..size])?;
        }
        self.clear_irq()?;
        self.standby()?;

        trace!("{} received {} bytes (irq 0x{:02X})", self.variant.name, size, flags);
        Ok(size)
    }

    fn scan_channel(&mut self) -> Result<bool, Error> {
        self.standby()?;
        self.clear_irq()?;
        self.set_mode(MODE_CAD)?;

        /* CAD lasts about two symbols */
        let timeout_us = self.symbol_us() * 4 + 10_000;
        let flags = self.wait_irq(REG_IRQ_FLAGS, IRQ_CAD_DONE, timeout_us)?;
        self.clear_irq()?;
        self.standby()?;
        Ok(matches!(flags, Some(flags) if flags & IRQ_CAD_DETECTED != 0))
    }

    fn signal_quality(&mut self) -> Option<SignalQuality> {
        let snr = self.r(REG_PKT_SNR_VALUE).ok()? as i8 as f32 / 4.0;
        let mut rssi = self.rssi_offset() + self.r(REG_PKT_RSSI_VALUE).ok()? as f32;
        if snr < 0.0 {
            rssi += snr;
        }
        let freq_error = self.read_frequency_error().ok()?;
        Some(SignalQuality { rssi, snr, freq_error })
    }

    fn configure_fsk(&mut self, bitrate_bps: u32, freq_dev_hz: u32) -> Result<(), Error> {
        if !(1200..=300000).contains(&bitrate_bps) {
            return Err(Error::InvalidBitRate);
        }
        if freq_dev_hz + bitrate_bps / 2 > 250000 {
            return Err(Error::InvalidFrequencyDeviation);
        }

        self.w(REG_OP_MODE, LONG_RANGE_MODE | MODE_SLEEP)?;
        self.w(REG_OP_MODE, MODE_SLEEP)?;
        self.w(REG_OP_MODE, MODE_STDBY)?;
        self.modem = Modem::Fsk;

        let bitrate = (LGW_XTAL_FREQU / bitrate_bps) as u16;
        self.wb(REG_FSK_BITRATE_MSB, &bitrate.to_be_bytes())?;
        let fdev = ((freq_dev_hz as f64 / 61.035) as u16) & 0x3FFF;
        self.wb(REG_FSK_FDEV_MSB, &fdev.to_be_bytes())?;

        self.w(REG_FSK_SYNC_CONFIG, 0x12)?; /* sync on, 3 bytes */
        self.wb(REG_FSK_SYNC_VALUE_1, &[0xC1, 0x94, 0xC1])?;
        self.w(REG_FSK_PACKET_CONFIG_1, 0xD0)?; /* variable length, whitening, CRC on */
        self.crc = true;

        debug!("{} switched to FSK {} bps, fdev {} Hz", self.variant.name, bitrate_bps, freq_dev_hz);
        Ok(())
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > u8::MAX as usize {
            return Err(Error::PacketTooLong);
        }
        self.standby()?;
        match self.modem {
            Modem::Lora => self.transmit_lora(payload),
            Modem::Fsk => self.transmit_fsk(payload),
        }
    }

    fn micros(&self) -> u64 {
        self.com.micros()
    }
}
