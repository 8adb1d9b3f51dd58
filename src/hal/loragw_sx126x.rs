use tracing::{debug, error, trace};

use super::error::Error;
use super::loragw_com::RadioCom;
use super::loragw_timestamp::{fsk_packet_time_on_air_ms, lora_packet_time_on_air};
use super::{bw_from_khz, cr_from_denominator, ChipFamily, ChipRegistry, LoraChip, RadioDriver, SignalQuality, LGW_XTAL_FREQU};

const STDBY_RC: u8 = 0x00;

const PACKET_TYPE_GFSK: u8 = 0x00;
const PACKET_TYPE_LORA: u8 = 0x01;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum Sx126xOpCode {
    CALIBRATE               = 0x89,
    CALIBRATE_IMAGE         = 0x98,
    CLR_IRQ_STATUS          = 0x02,
    SET_DIO2_AS_RF_SWITCH   = 0x9D,
    GET_IRQ_STATUS          = 0x12,
    GET_RX_BUFFER_STATUS    = 0x13,
    GET_PACKET_STATUS       = 0x14,
    READ_BUFFER             = 0x1E,
    READ_REGISTER           = 0x1D,
    SET_DIO_IRQ_PARAMS      = 0x08,
    SET_MODULATION_PARAMS   = 0x8B,
    SET_PA_CONFIG           = 0x95,
    SET_PACKET_PARAMS       = 0x8C,
    SET_PACKET_TYPE         = 0x8A,
    SET_RF_FREQUENCY        = 0x86,
    SET_BUFFER_BASE_ADDRESS = 0x8F,
    SET_STANDBY             = 0x80,
    SET_RX                  = 0x82,
    SET_TX                  = 0x83,
    SET_TX_PARAMS           = 0x8E,
    SET_CAD_PARAMS          = 0x88,
    SET_CAD                 = 0xC5,
    WRITE_BUFFER            = 0x0E,
    WRITE_REGISTER          = 0x0D,
    GET_STATUS              = 0xC0,
    SET_REGULATORMODE       = 0x96,
}

const REG_GFSK_SYNC_WORD: u16 = 0x06C0;
const REG_IQ_POLARITY_SETUP: u16 = 0x0736;
const REG_LORA_SYNC_WORD_MSB: u16 = 0x0740;
const REG_OCP_CONFIGURATION: u16 = 0x08E7;

const IRQ_TX_DONE: u16 = 1 << 0;
const IRQ_RX_DONE: u16 = 1 << 1;
const IRQ_HEADER_ERR: u16 = 1 << 5;
const IRQ_CRC_ERR: u16 = 1 << 6;
const IRQ_CAD_DONE: u16 = 1 << 7;
const IRQ_CAD_DETECTED: u16 = 1 << 8;
const IRQ_TIMEOUT: u16 = 1 << 9;
const IRQ_ALL: u16 = 0x03FF;

const CHIP_MODE_STBY_RC: u8 = 0x2;

const WAIT_BUSY_SX126X_MS: u32 = 1;
const STATUS_READ_ATTEMPTS: u32 = 10;
const RX_SYMBOL_TIMEOUT: u64 = 100;
const NOP: u8 = 0x00;

macro_rules! take_n_bits_from {
    ($b:expr, $p:expr, $n:expr) => {
        (($b >> $p) & ((1 << $n) - 1))
    };
}

fn sx126x_freq_to_reg(freq_mhz: f32) -> u32 {
    ((freq_mhz as f64 * 1e6 * (1u64 << 25) as f64) / LGW_XTAL_FREQU as f64) as u32
}

/* image calibration bands, MHz */
const IMAGE_CALIBRATION: [(f32, f32, [u8; 2]); 5] = [
    (430.0, 440.0, [0x6B, 0x6F]),
    (470.0, 510.0, [0x75, 0x81]),
    (779.0, 787.0, [0xC1, 0xC5]),
    (863.0, 870.0, [0xD7, 0xDB]),
    (902.0, 928.0, [0xE1, 0xE9]),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipVariant {
    pub name: &'static str,
    pub freq_min_mhz: f32,
    pub freq_max_mhz: f32,
    pub power_min_dbm: i8,
    pub power_max_dbm: i8,
    pa_config: [u8; 4],
    /// SF ceiling tied to the bandwidth (LLCC68).
    bandwidth_bound_sf: bool,
}

pub const SX1261: ChipVariant = ChipVariant {
    name: "SX1261",
    freq_min_mhz: 150.0,
    freq_max_mhz: 960.0,
    power_min_dbm: -17,
    power_max_dbm: 15,
    pa_config: [0x06, 0x00, 0x01, 0x01],
    bandwidth_bound_sf: false,
};

pub const SX1262: ChipVariant = ChipVariant {
    name: "SX1262",
    freq_min_mhz: 150.0,
    freq_max_mhz: 960.0,
    power_min_dbm: -9,
    power_max_dbm: 22,
    pa_config: [0x04, 0x07, 0x00, 0x01],
    bandwidth_bound_sf: false,
};

pub const SX1268: ChipVariant = ChipVariant {
    name: "SX1268",
    freq_min_mhz: 410.0,
    freq_max_mhz: 810.0,
    ..SX1262
};

pub const LLCC68: ChipVariant = ChipVariant {
    name: "LLCC68",
    bandwidth_bound_sf: true,
    ..SX1262
};

pub static VARIANTS: [ChipVariant; 4] = [SX1261, SX1262, SX1268, LLCC68];

pub fn register_variants<C: RadioCom + 'static>(registry: &mut ChipRegistry<C>) {
    for variant in VARIANTS.iter() {
        registry.register(variant.name, move |com| LoraChip::Sx126x(Sx126x::new(com, variant)));
    }
}

fn bw_code(bandwidth_khz: f32) -> Option<u8> {
    const TABLE: [(f32, u8); 10] = [
        (7.8, 0x00),
        (10.4, 0x08),
        (15.6, 0x01),
        (20.8, 0x09),
        (31.25, 0x02),
        (41.7, 0x0A),
        (62.5, 0x03),
        (125.0, 0x04),
        (250.0, 0x05),
        (500.0, 0x06),
    ];
    TABLE
        .iter()
        .find(|(bw, _)| libm::fabsf(bandwidth_khz - bw) <= 0.001)
        .map(|(_, code)| *code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modem {
    Lora,
    Fsk,
}

#[derive(Debug)]
pub struct Sx126x<C> {
    com: C,
    variant: &'static ChipVariant,
    modem: Modem,
    bandwidth_khz: f32,
    sf: u8,
    coding_rate: u8,
    preamble_length: u16,
    crc: bool,
    invert_iq: bool,
    fsk_bitrate: u32,
}

impl<C: RadioCom> Sx126x<C> {
    pub fn new(com: C, variant: &'static ChipVariant) -> Self {
        Self {
            com,
            variant,
            modem: Modem::Lora,
            bandwidth_khz: 125.0,
            sf: 9,
            coding_rate: 7,
            preamble_length: 8,
            crc: true,
            invert_iq: false,
            fsk_bitrate: 0,
        }
    }

    pub fn variant(&self) -> &ChipVariant {
        self.variant
    }

    pub fn com(&mut self) -> &mut C {
        &mut self.com
    }

    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        /* wait BUSY */
        self.com.delay_ms(WAIT_BUSY_SX126X_MS);
        self.com.spi_transfer(buf).map_err(|e| {
            error!("ERROR: {} SPI command 0x{:02X} failed: {}", self.variant.name, buf[0], e);
            Error::SpiWriteFailed
        })
    }

    fn sx126x_w(&mut self, op_code: Sx126xOpCode, data: &[u8]) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(op_code as u8);
        buf.extend_from_slice(data);
        self.transfer(&mut buf)
    }

    /* status byte comes first, then the answer */
    fn sx126x_r(&mut self, op_code: Sx126xOpCode, data: &mut [u8]) -> Result<u8, Error> {
        let mut buf = vec![NOP; data.len() + 2];
        buf[0] = op_code as u8;
        self.transfer(&mut buf)?;
        data.copy_from_slice(&buf[2..]);
        Ok(buf[1])
    }

    fn sx126x_reg_w(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        let mut buf = vec![(address >> 8) as u8, address as u8];
        buf.extend_from_slice(data);
        self.sx126x_w(Sx126xOpCode::WRITE_REGISTER, &buf)
    }

    fn sx126x_reg_r(&mut self, address: u16, data: &mut [u8]) -> Result<(), Error> {
        let mut buf = vec![NOP; data.len() + 4];
        buf[0] = Sx126xOpCode::READ_REGISTER as u8;
        buf[1] = (address >> 8) as u8;
        buf[2] = address as u8;
        self.transfer(&mut buf)?;
        data.copy_from_slice(&buf[4..]);
        Ok(())
    }

    fn get_status(&mut self) -> Result<u8, Error> {
        let mut buf = [Sx126xOpCode::GET_STATUS as u8, NOP];
        self.transfer(&mut buf)?;
        Ok(buf[1])
    }

    fn standby(&mut self) -> Result<(), Error> {
        self.sx126x_w(Sx126xOpCode::SET_STANDBY, &[STDBY_RC])
    }

    fn set_irq(&mut self, mask: u16) -> Result<(), Error> {
        let m = mask.to_be_bytes();
        self.sx126x_w(Sx126xOpCode::SET_DIO_IRQ_PARAMS, &[m[0], m[1], m[0], m[1], 0, 0, 0, 0])?;
        self.clear_irq()
    }

    fn clear_irq(&mut self) -> Result<(), Error> {
        self.sx126x_w(Sx126xOpCode::CLR_IRQ_STATUS, &IRQ_ALL.to_be_bytes())
    }

    fn irq_status(&mut self) -> Result<u16, Error> {
        let mut irq = [0u8; 2];
        self.sx126x_r(Sx126xOpCode::GET_IRQ_STATUS, &mut irq)?;
        Ok(u16::from_be_bytes(irq))
    }

    fn wait_irq(&mut self, mask: u16, timeout_us: u64) -> Result<u16, Error> {
        let start = self.com.micros();
        loop {
            let irq = self.irq_status()?;
            if irq & mask != 0 || self.com.micros().saturating_sub(start) > timeout_us {
                return Ok(irq);
            }
            self.com.delay_ms(1);
        }
    }

    fn symbol_us(&self) -> u64 {
        ((1u64 << self.sf) as f64 * 1000.0 / self.bandwidth_khz as f64) as u64
    }

    fn packet_time_us(&self, size: u8) -> u64 {
        match self.modem {
            Modem::Lora => {
                let bw = bw_from_khz(self.bandwidth_khz);
                let cr = cr_from_denominator(self.coding_rate);
                match lora_packet_time_on_air(bw, self.sf, cr, self.preamble_length, false, !self.crc, size) {
                    Ok((toa_us, _, _, _)) => toa_us as u64,
                    Err(_) => self.symbol_us() * (self.preamble_length as u64 + 8 + 2 * size as u64 + 20),
                }
            }
            Modem::Fsk => fsk_packet_time_on_air_ms(self.fsk_bitrate, self.preamble_length, size, self.crc) as u64 * 1000,
        }
    }

    fn max_sf(&self) -> u8 {
        if !self.variant.bandwidth_bound_sf {
            return 12;
        }
        match bw_from_khz(self.bandwidth_khz) {
            super::BW_125KHZ => 9,
            super::BW_250KHZ => 10,
            _ => 11,
        }
    }

    fn apply_modulation_params(&mut self) -> Result<(), Error> {
        let bw = bw_code(self.bandwidth_khz).ok_or(Error::InvalidBandwidth)?;
        let symbol_ms = (1u32 << self.sf) as f32 / self.bandwidth_khz;
        let ldro = if symbol_ms >= 16.38 { 1 } else { 0 };
        self.sx126x_w(
            Sx126xOpCode::SET_MODULATION_PARAMS,
            &[self.sf, bw, self.coding_rate - 4, ldro],
        )
    }

    fn apply_packet_params(&mut self, payload_len: u8) -> Result<(), Error> {
        let preamble = self.preamble_length.to_be_bytes();
        match self.modem {
            Modem::Lora => self.sx126x_w(
                Sx126xOpCode::SET_PACKET_PARAMS,
                &[preamble[0], preamble[1], 0x00, payload_len, self.crc as u8, self.invert_iq as u8],
            ),
            Modem::Fsk => {
                let bits = (self.preamble_length.saturating_mul(8)).to_be_bytes();
                self.sx126x_w(
                    Sx126xOpCode::SET_PACKET_PARAMS,
                    &[bits[0], bits[1], 0x05, 24, 0x00, 0x01, payload_len, if self.crc { 0x02 } else { 0x01 }, 0x01],
                )
            }
        }
    }

    /* IQ polarity errata: bit 2 cleared when inverted */
    fn apply_iq_polarity(&mut self) -> Result<(), Error> {
        let mut reg = [0u8];
        self.sx126x_reg_r(REG_IQ_POLARITY_SETUP, &mut reg)?;
        let value = if self.invert_iq { reg[0] & !0x04 } else { reg[0] | 0x04 };
        self.sx126x_reg_w(REG_IQ_POLARITY_SETUP, &[value])
    }
}

impl<C: RadioCom> RadioDriver for Sx126x<C> {
    fn model(&self) -> &str {
        self.variant.name
    }

    fn family(&self) -> ChipFamily {
        ChipFamily::WithoutFrequencyError
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.com.set_reset(true).map_err(|_| Error::SpiWriteFailed)?;
        self.com.delay_ms(1);
        self.com.set_reset(false).map_err(|_| Error::SpiWriteFailed)?;
        self.com.delay_ms(5);
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        let mut found = false;
        for _ in 0..STATUS_READ_ATTEMPTS {
            self.standby()?;
            let status = self.get_status()?;
            if take_n_bits_from!(status, 4, 3) == CHIP_MODE_STBY_RC {
                found = true;
                break;
            }
            trace!("{} status 0x{:02X}, retrying", self.variant.name, status);
            self.com.delay_ms(10);
        }
        if !found {
            error!("ERROR: {} not found (no STDBY_RC status)", self.variant.name);
            return Err(Error::ChipNotFound);
        }

        self.sx126x_w(Sx126xOpCode::SET_PACKET_TYPE, &[PACKET_TYPE_LORA])?;
        self.modem = Modem::Lora;
        self.sx126x_w(Sx126xOpCode::SET_REGULATORMODE, &[0x01])?; /* DC-DC */
        self.sx126x_w(Sx126xOpCode::SET_BUFFER_BASE_ADDRESS, &[0x00, 0x00])?;
        self.sx126x_w(Sx126xOpCode::SET_DIO2_AS_RF_SWITCH, &[0x01])?;
        self.sx126x_w(Sx126xOpCode::CALIBRATE, &[0x7F])?; /* all blocks */
        self.com.delay_ms(5);

        debug!("{} found and calibrated", self.variant.name);
        Ok(())
    }

    fn set_frequency(&mut self, freq_mhz: f32) -> Result<(), Error> {
        if freq_mhz < self.variant.freq_min_mhz || freq_mhz > self.variant.freq_max_mhz {
            return Err(Error::InvalidFrequency);
        }
        self.standby()?;
        if let Some((_, _, band)) = IMAGE_CALIBRATION.iter().find(|(lo, hi, _)| freq_mhz >= *lo && freq_mhz <= *hi) {
            self.sx126x_w(Sx126xOpCode::CALIBRATE_IMAGE, band)?;
        }
        let freq_reg = sx126x_freq_to_reg(freq_mhz);
        self.sx126x_w(
            Sx126xOpCode::SET_RF_FREQUENCY,
            &[
                take_n_bits_from!(freq_reg, 24, 8) as u8,
                take_n_bits_from!(freq_reg, 16, 8) as u8,
                take_n_bits_from!(freq_reg, 8, 8) as u8,
                take_n_bits_from!(freq_reg, 0, 8) as u8,
            ],
        )
    }

    fn set_bandwidth(&mut self, bandwidth_khz: f32) -> Result<(), Error> {
        if bw_code(bandwidth_khz).is_none() || (self.variant.bandwidth_bound_sf && bw_from_khz(bandwidth_khz) == super::BW_UNDEFINED) {
            return Err(Error::InvalidBandwidth);
        }
        self.standby()?;
        self.bandwidth_khz = bandwidth_khz;
        if self.sf > self.max_sf() {
            self.sf = self.max_sf();
        }
        self.apply_modulation_params()
    }

    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Error> {
        if sf < 5 || sf > self.max_sf() {
            return Err(Error::InvalidSpreadingFactor);
        }
        self.standby()?;
        self.sf = sf;
        self.apply_modulation_params()
    }

    fn set_coding_rate(&mut self, coding_rate: u8) -> Result<(), Error> {
        if !(5..=8).contains(&coding_rate) {
            return Err(Error::InvalidCodingRate);
        }
        self.standby()?;
        self.coding_rate = coding_rate;
        self.apply_modulation_params()
    }

    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), Error> {
        self.standby()?;
        self.sx126x_reg_w(
            REG_LORA_SYNC_WORD_MSB,
            &[(sync_word & 0xF0) | 0x04, ((sync_word & 0x0F) << 4) | 0x04],
        )
    }

    fn set_preamble_length(&mut self, preamble_length: u16) -> Result<(), Error> {
        if preamble_length == 0 {
            return Err(Error::InvalidPreambleLength);
        }
        self.standby()?;
        self.preamble_length = preamble_length;
        self.apply_packet_params(0xFF)
    }

    fn set_output_power(&mut self, power_dbm: i8) -> Result<(), Error> {
        let (min, max) = self.output_power_range();
        if power_dbm < min || power_dbm > max {
            return Err(Error::InvalidOutputPower);
        }
        self.standby()?;
        let pa_config = self.variant.pa_config;
        self.sx126x_w(Sx126xOpCode::SET_PA_CONFIG, &pa_config)?;
        self.sx126x_w(Sx126xOpCode::SET_TX_PARAMS, &[power_dbm as u8, 0x04]) /* 200 us ramp */
    }

    fn output_power_range(&self) -> (i8, i8) {
        (self.variant.power_min_dbm, self.variant.power_max_dbm)
    }

    fn set_current_limit(&mut self, current_ma: u8) -> Result<(), Error> {
        if current_ma > 140 {
            return Err(Error::InvalidCurrentLimit);
        }
        self.standby()?;
        let raw = (current_ma as f32 / 2.5) as u8;
        self.sx126x_reg_w(REG_OCP_CONFIGURATION, &[raw])
    }

    fn set_crc(&mut self, enable: bool) -> Result<(), Error> {
        self.standby()?;
        self.crc = enable;
        self.apply_packet_params(0xFF)
    }

    fn invert_iq(&mut self, invert: bool) -> Result<(), Error> {
        self.standby()?;
        self.invert_iq = invert;
        self.apply_packet_params(0xFF)?;
        if self.modem == Modem::Lora {
            self.apply_iq_polarity()?;
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.standby()?;
        self.apply_packet_params(0xFF)?;
        self.set_irq(IRQ_RX_DONE | IRQ_TIMEOUT | IRQ_CRC_ERR | IRQ_HEADER_ERR)?;

        let timeout_us = self.symbol_us() * RX_SYMBOL_TIMEOUT + self.packet_time_us(u8::MAX);
        /* 15.625 us steps */
        let raw = (timeout_us * 64 / 1000).min(0xFF_FFFE) as u32;
        self.sx126x_w(
            Sx126xOpCode::SET_RX,
            &[take_n_bits_from!(raw, 16, 8) as u8, take_n_bits_from!(raw, 8, 8) as u8, take_n_bits_from!(raw, 0, 8) as u8],
        )?;

        let irq = self.wait_irq(IRQ_RX_DONE | IRQ_TIMEOUT | IRQ_HEADER_ERR, timeout_us + 100_000)?;
        let result = if irq & IRQ_HEADER_ERR != 0 {
            Err(Error::LoraHeaderDamaged)
        } else if irq & IRQ_RX_DONE == 0 {
            Err(Error::RxTimeout)
        } else if irq & IRQ_CRC_ERR != 0 {
            Err(Error::CrcMismatch)
        } else {
            let mut status = [0u8; 2];
            self.sx126x_r(Sx126xOpCode::GET_RX_BUFFER_STATUS, &mut status)?;
            let size = (status[0] as usize).min(buf.len());
            if size > 0 {
                let mut cmd = vec![NOP; size + 3];
                cmd[0] = Sx126xOpCode::READ_BUFFER as u8;
                cmd[1] = status[1];
                self.transfer(&mut cmd)?;
                buf[..size].copy_from_slice(&cmd[3..]);
            }
            Ok(size)
        };

        self.clear_irq()?;
        self.standby()?;
        result
    }

    fn scan_channel(&mut self) -> Result<bool, Error> {
        self.standby()?;
        self.sx126x_w(Sx126xOpCode::SET_CAD_PARAMS, &[0x01, self.sf + 13, 10, 0x00, 0x00, 0x00, 0x00])?;
        self.set_irq(IRQ_CAD_DONE | IRQ_CAD_DETECTED)?;
        self.sx126x_w(Sx126xOpCode::SET_CAD, &[])?;

        let irq = self.wait_irq(IRQ_CAD_DONE, self.symbol_us() * 4 + 10_000)?;
        self.clear_irq()?;
        Ok(irq & IRQ_CAD_DONE != 0 && irq & IRQ_CAD_DETECTED != 0)
    }

    fn signal_quality(&mut self) -> Option<SignalQuality> {
        let mut status = [0u8; 3];
        self.sx126x_r(Sx126xOpCode::GET_PACKET_STATUS, &mut status).ok()?;
        Some(SignalQuality {
            rssi: -(status[0] as f32) / 2.0,
            snr: status[1] as i8 as f32 / 4.0,
            freq_error: 0.0,
        })
    }

    fn configure_fsk(&mut self, bitrate_bps: u32, freq_dev_hz: u32) -> Result<(), Error> {
        if !(600..=300000).contains(&bitrate_bps) {
            return Err(Error::InvalidBitRate);
        }
        if freq_dev_hz > 200000 {
            return Err(Error::InvalidFrequencyDeviation);
        }
        self.standby()?;
        self.sx126x_w(Sx126xOpCode::SET_PACKET_TYPE, &[PACKET_TYPE_GFSK])?;
        self.modem = Modem::Fsk;
        self.fsk_bitrate = bitrate_bps;

        let br = ((32 * LGW_XTAL_FREQU as u64) / bitrate_bps as u64) as u32;
        let fdev = ((freq_dev_hz as u64 * (1u64 << 25)) / LGW_XTAL_FREQU as u64) as u32;
        self.sx126x_w(
            Sx126xOpCode::SET_MODULATION_PARAMS,
            &[
                take_n_bits_from!(br, 16, 8) as u8,
                take_n_bits_from!(br, 8, 8) as u8,
                take_n_bits_from!(br, 0, 8) as u8,
                0x00, /* no shaping */
                0x1A, /* rx bandwidth 156.2 kHz */
                take_n_bits_from!(fdev, 16, 8) as u8,
                take_n_bits_from!(fdev, 8, 8) as u8,
                take_n_bits_from!(fdev, 0, 8) as u8,
            ],
        )?;
        self.sx126x_reg_w(REG_GFSK_SYNC_WORD, &[0xC1, 0x94, 0xC1])?;
        self.crc = true;
        self.apply_packet_params(0xFF)?;

        debug!("{} switched to GFSK {} bps, fdev {} Hz", self.variant.name, bitrate_bps, freq_dev_hz);
        Ok(())
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > u8::MAX as usize {
            return Err(Error::PacketTooLong);
        }
        self.standby()?;
        self.sx126x_w(Sx126xOpCode::SET_BUFFER_BASE_ADDRESS, &[0x00, 0x00])?;
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(0x00); /* offset */
        data.extend_from_slice(payload);
        self.sx126x_w(Sx126xOpCode::WRITE_BUFFER, &data)?;
        self.apply_packet_params(payload.len() as u8)?;
        self.set_irq(IRQ_TX_DONE | IRQ_TIMEOUT)?;
        self.sx126x_w(Sx126xOpCode::SET_TX, &[0x00, 0x00, 0x00])?;

        let timeout_us = self.packet_time_us(payload.len() as u8) * 5 / 4 + 100_000;
        let irq = self.wait_irq(IRQ_TX_DONE | IRQ_TIMEOUT, timeout_us)?;
        self.clear_irq()?;
        self.standby()?;
        if irq & IRQ_TX_DONE != 0 {
            Ok(())
        } else {
            Err(Error::TxTimeout)
        }
    }

    fn micros(&self) -> u64 {
        self.com.micros()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;

    use super::*;

    /// Command-level model of an SX126x answering the opcodes the driver issues.
    #[derive(Debug)]
    struct Sx126xBus {
        commands: Vec<Vec<u8>>,
        chip_mode: u8,
        irq: u16,
        packet_type: u8,
        sf: u8,
        buffer: [u8; 256],
        regs: HashMap<u16, u8>,
        rx_frame: Vec<u8>,
        rx_extra_irq: u16,
        packet_status: [u8; 3],
        cad_detect_sf: Option<u8>,
    }

    impl Sx126xBus {
        fn new() -> Self {
            Self {
                commands: Vec::new(),
                chip_mode: CHIP_MODE_STBY_RC,
                irq: 0,
                packet_type: PACKET_TYPE_LORA,
                sf: 7,
                buffer: [0u8; 256],
                regs: HashMap::new(),
                rx_frame: Vec::new(),
                rx_extra_irq: 0,
                packet_status: [0u8; 3],
                cad_detect_sf: None,
            }
        }

        fn last(&self, op: Sx126xOpCode) -> Option<&Vec<u8>> {
            self.commands.iter().rev().find(|c| c[0] == op as u8)
        }
    }

    impl RadioCom for Sx126xBus {
        fn spi_transfer(&mut self, buf: &mut [u8]) -> Result<()> {
            self.commands.push(buf.to_vec());
            let status = self.chip_mode << 4;
            match buf[0] {
                0xC0 => buf[1] = status,
                0x12 => {
                    buf[1] = status;
                    buf[2..4].copy_from_slice(&self.irq.to_be_bytes());
                }
                0x02 => self.irq &= !u16::from_be_bytes([buf[1], buf[2]]),
                0x8A => self.packet_type = buf[1],
                0x8B if self.packet_type == PACKET_TYPE_LORA => self.sf = buf[1],
                0x13 => {
                    buf[2] = self.rx_frame.len() as u8;
                    buf[3] = 0;
                }
                0x14 => buf[2..5].copy_from_slice(&self.packet_status),
                0x0E => {
                    let offset = buf[1] as usize;
                    for (k, b) in buf[2..].iter().enumerate() {
                        self.buffer[offset + k] = *b;
                    }
                }
                0x1E => {
                    let offset = buf[1] as usize;
                    for (k, b) in buf[3..].iter_mut().enumerate() {
                        *b = self.buffer[offset + k];
                    }
                }
                0x0D => {
                    let addr = u16::from_be_bytes([buf[1], buf[2]]);
                    for (k, b) in buf[3..].iter().enumerate() {
                        self.regs.insert(addr + k as u16, *b);
                    }
                }
                0x1D => {
                    let addr = u16::from_be_bytes([buf[1], buf[2]]);
                    for (k, b) in buf[4..].iter_mut().enumerate() {
                        *b = *self.regs.get(&(addr + k as u16)).unwrap_or(&0);
                    }
                }
                0x82 => {
                    if self.rx_frame.is_empty() {
                        self.irq |= IRQ_TIMEOUT;
                    } else {
                        self.buffer[..self.rx_frame.len()].copy_from_slice(&self.rx_frame);
                        self.irq |= IRQ_RX_DONE | self.rx_extra_irq;
                    }
                }
                0x83 => self.irq |= IRQ_TX_DONE,
                0xC5 => {
                    let detected = if self.cad_detect_sf == Some(self.sf) { IRQ_CAD_DETECTED } else { 0 };
                    self.irq |= IRQ_CAD_DONE | detected;
                }
                _ => {}
            }
            Ok(())
        }

        fn set_reset(&mut self, _active: bool) -> Result<()> {
            Ok(())
        }

        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn started(variant: &'static ChipVariant) -> Sx126x<Sx126xBus> {
        let mut chip = Sx126x::new(Sx126xBus::new(), variant);
        chip.begin().unwrap();
        chip
    }

    #[test]
    fn begin_requires_standby_status() {
        let chip = started(&SX1262);
        assert_eq!(chip.model(), "SX1262");

        let mut bus = Sx126xBus::new();
        bus.chip_mode = 0x0;
        let mut chip = Sx126x::new(bus, &SX1262);
        assert_eq!(chip.begin(), Err(Error::ChipNotFound));
    }

    #[test]
    fn frequency_and_image_calibration() {
        let mut chip = started(&SX1262);
        chip.set_frequency(868.0).unwrap();
        assert_eq!(chip.com().last(Sx126xOpCode::CALIBRATE_IMAGE).unwrap()[1..], [0xD7, 0xDB]);
        assert_eq!(chip.com().last(Sx126xOpCode::SET_RF_FREQUENCY).unwrap()[1..], [0x36, 0x40, 0x00, 0x00]);

        let mut chip = started(&SX1268);
        assert_eq!(chip.set_frequency(868.0), Err(Error::InvalidFrequency));
    }

    #[test]
    fn modulation_parameters() {
        let mut chip = started(&SX1262);
        chip.set_bandwidth(125.0).unwrap();
        chip.set_coding_rate(5).unwrap();
        chip.set_spreading_factor(12).unwrap();
        assert_eq!(chip.com().last(Sx126xOpCode::SET_MODULATION_PARAMS).unwrap()[1..], [12, 0x04, 1, 1]);
        chip.set_spreading_factor(7).unwrap();
        assert_eq!(chip.com().last(Sx126xOpCode::SET_MODULATION_PARAMS).unwrap()[1..], [7, 0x04, 1, 0]);
        assert_eq!(chip.set_bandwidth(300.0), Err(Error::InvalidBandwidth));
    }

    #[test]
    fn llcc68_spreading_factor_follows_bandwidth() {
        let mut chip = started(&LLCC68);
        chip.set_bandwidth(125.0).unwrap();
        assert_eq!(chip.set_spreading_factor(10), Err(Error::InvalidSpreadingFactor));
        chip.set_bandwidth(500.0).unwrap();
        chip.set_spreading_factor(11).unwrap();
        assert_eq!(chip.set_bandwidth(62.5), Err(Error::InvalidBandwidth));
    }

    #[test]
    fn sync_word_power_and_current() {
        let mut chip = started(&SX1262);
        chip.set_sync_word(0x34).unwrap();
        assert_eq!(chip.com().regs.get(&0x0740), Some(&0x34));
        assert_eq!(chip.com().regs.get(&0x0741), Some(&0x44));

        chip.set_output_power(22).unwrap();
        assert_eq!(chip.com().last(Sx126xOpCode::SET_PA_CONFIG).unwrap()[1..], [0x04, 0x07, 0x00, 0x01]);
        assert_eq!(chip.com().last(Sx126xOpCode::SET_TX_PARAMS).unwrap()[1..], [22, 0x04]);

        chip.set_current_limit(140).unwrap();
        assert_eq!(chip.com().regs.get(&0x08E7), Some(&56));
        assert_eq!(chip.set_current_limit(141), Err(Error::InvalidCurrentLimit));

        let mut chip = started(&SX1261);
        assert_eq!(chip.output_power_range(), (-17, 15));
        assert_eq!(chip.set_output_power(22), Err(Error::InvalidOutputPower));
    }

    #[test]
    fn receive_frame_and_quality() {
        let mut chip = started(&SX1262);
        let frame: Vec<u8> = (100..120).collect();
        chip.com().rx_frame = frame.clone();
        chip.com().packet_status = [160, 30, 0];

        let mut buf = [0u8; 256];
        let size = chip.receive(&mut buf).unwrap();
        assert_eq!(&buf[..size], &frame[..]);

        let quality = chip.signal_quality().unwrap();
        assert_eq!(quality.rssi, -80.0);
        assert_eq!(quality.snr, 7.5);
        assert_eq!(quality.freq_error, 0.0);
    }

    #[test]
    fn receive_errors() {
        let mut chip = started(&SX1262);
        let mut buf = [0u8; 256];
        assert_eq!(chip.receive(&mut buf), Err(Error::RxTimeout));

        chip.com().rx_frame = vec![1, 2, 3];
        chip.com().rx_extra_irq = IRQ_CRC_ERR;
        assert_eq!(chip.receive(&mut buf), Err(Error::CrcMismatch));

        chip.com().rx_extra_irq = IRQ_HEADER_ERR;
        assert_eq!(chip.receive(&mut buf), Err(Error::LoraHeaderDamaged));
    }

    #[test]
    fn channel_activity_and_iq() {
        let mut chip = started(&SX1262);
        chip.com().cad_detect_sf = Some(9);
        chip.set_spreading_factor(8).unwrap();
        assert!(!chip.scan_channel().unwrap());
        chip.set_spreading_factor(9).unwrap();
        assert!(chip.scan_channel().unwrap());

        chip.invert_iq(true).unwrap();
        assert_eq!(chip.com().last(Sx126xOpCode::SET_PACKET_PARAMS).unwrap()[6], 1);
        assert_eq!(chip.com().regs.get(&0x0736).map(|v| v & 0x04), Some(0));
        chip.invert_iq(false).unwrap();
        assert_eq!(chip.com().regs.get(&0x0736).map(|v| v & 0x04), Some(0x04));
    }

    #[test]
    fn transmit_lora_and_gfsk() {
        let mut chip = started(&SX1262);
        chip.set_bandwidth(125.0).unwrap();
        chip.set_spreading_factor(7).unwrap();
        chip.set_coding_rate(5).unwrap();
        chip.transmit(&[0xAA, 0xBB]).unwrap();
        assert_eq!(chip.com().buffer[..2], [0xAA, 0xBB]);
        assert_eq!(chip.com().last(Sx126xOpCode::SET_PACKET_PARAMS).unwrap()[4], 2);
        assert_eq!(chip.transmit(&[0u8; 256]), Err(Error::PacketTooLong));

        chip.configure_fsk(50000, 25000).unwrap();
        assert_eq!(chip.com().packet_type, PACKET_TYPE_GFSK);
        /* 32 * 32 MHz / 50 kbps = 20480, 25 kHz * 2^25 / 32 MHz = 26214 */
        assert_eq!(
            chip.com().last(Sx126xOpCode::SET_MODULATION_PARAMS).unwrap()[1..],
            [0x00, 0x50, 0x00, 0x00, 0x1A, 0x00, 0x66, 0x66]
        );
        chip.transmit(&[0x01]).unwrap();
        assert_eq!(chip.configure_fsk(100, 1000), Err(Error::InvalidBitRate));
    }
}
