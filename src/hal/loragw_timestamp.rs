use anyhow::{anyhow, Result};
use tracing::{error, trace};

use super::{is_lora_bw, is_lora_cr, is_lora_dr, is_ppm_on, BW_125KHZ, BW_250KHZ, BW_500KHZ};

/* constant part of the TX path latency, us */
pub const TX_START_DELAY_US: u32 = 3536;

/* FSK latency is an empirical fit: offset + 680000 / datarate - 20 */
const FSK_DELAY_NUMERATOR: u32 = 680000;
const FSK_DELAY_TRIM_US: u32 = 20;

/**
@brief Delay between the TX request and the first radiated bit, in us
@param fsk_datarate FSK bitrate in bps, 0 for LoRa
@param packet_size payload size in bytes
@param sf LoRa spreading factor
@param bandwidth_khz LoRa bandwidth, one of 125/250/500
@param coding_rate denominator of the 4/x coding rate
@param crc_en payload CRC enabled
@param ppm low data rate optimisation enabled
@param spi_freq_hz SPI clock of the radio bus, 0 if unknown
@return the correction to subtract from the scheduled count

All arithmetic is 32-bit wrapping; the result is kept bit-exact with the
packet forwarders deployed alongside this one.
*/
#[allow(clippy::too_many_arguments)]
pub fn compute_rf_tx_timestamp_correction_us(
    fsk_datarate: u32,
    packet_size: u32,
    sf: u32,
    bandwidth_khz: u32,
    coding_rate: u32,
    crc_en: bool,
    ppm: bool,
    spi_freq_hz: u32,
) -> u32 {
    if fsk_datarate != 0 {
        return TX_START_DELAY_US
            .wrapping_add(FSK_DELAY_NUMERATOR / fsk_datarate)
            .wrapping_sub(FSK_DELAY_TRIM_US);
    }

    let cr = coding_rate.wrapping_sub(4);

    let (delay_x, bw_pow): (u32, u32) = match bandwidth_khz {
        125 => (64, 1),
        250 => (32, 2),
        500 => (16, 4),
        _ => (0, 0),
    };

    let sz = packet_size;
    let crc = crc_en as u32;
    let ppm = ppm as u32;

    let timestamp_correction = if (6..=12).contains(&sf) && bw_pow > 0 {
        let nibbles = 2u32.wrapping_mul(sz.wrapping_add(2 * crc));
        let (delay_y, delay_z) = if nibbles.wrapping_sub(sf.wrapping_sub(7)) == 0 {
            /* payload fits entirely in the first 8 symbols */
            let y = ((1u32 << (sf - 1)) * (sf + 1) + 3 * (1u32 << (sf - 4))) / bw_pow;
            let z = 32u32.wrapping_mul(nibbles.wrapping_add(5)) / bw_pow;
            (y, z)
        } else {
            let y = ((1u32 << (sf - 1)) * (sf + 1) + (4 - ppm) * (1u32 << (sf - 4))) / bw_pow;
            let blocks = nibbles.wrapping_sub(sf).wrapping_add(6) % (sf - 2 * ppm);
            let z = (16u32.wrapping_add(4u32.wrapping_mul(cr))).wrapping_mul(blocks + 1) / bw_pow;
            (y, z)
        };
        delay_x.wrapping_add(delay_y).wrapping_add(delay_z)
    } else {
        0
    };

    let spi_correction_us = if spi_freq_hz == 0 {
        0
    } else {
        (1_000_000_000.0f64 / spi_freq_hz as f64 * 2.0 / 1000.0) as u32
    };

    trace!(
        "TX timestamp correction: sf={} bw={} cr=4/{} size={} -> {} + {} + {} us",
        sf,
        bandwidth_khz,
        coding_rate,
        packet_size,
        TX_START_DELAY_US,
        timestamp_correction,
        spi_correction_us
    );

    TX_START_DELAY_US.wrapping_add(timestamp_correction).wrapping_add(spi_correction_us)
}

/**
@brief LoRa packet time on air
@param bw bandwidth code (BW_125KHZ, ...)
@param sf spreading factor
@param cr coding rate code (CR_LORA_4_5, ...)
@return (time on air in us, number of symbols, payload symbols, symbol duration in us)
*/
pub fn lora_packet_time_on_air(
    bw: u8,
    sf: u8,
    cr: u8,
    n_symbol_preamble: u16,
    no_header: bool,
    no_crc: bool,
    size: u8,
) -> Result<(u32, f64, u32, u16)> {
    /* Check input parameters */
    if !is_lora_dr(sf as u32) {
        error!("ERROR: wrong datarate");
        return Err(anyhow!("LGW_HAL_ERR"));
    }
    if !is_lora_bw(bw) {
        error!("ERROR: wrong bandwidth");
        return Err(anyhow!("LGW_HAL_ERR"));
    }
    if !is_lora_cr(cr) {
        error!("ERROR: wrong coding rate");
        return Err(anyhow!("LGW_HAL_ERR"));
    }

    /* Get bandwidth 125KHz divider*/
    let bw_pow: u16 = match bw {
        BW_125KHZ => 1,
        BW_250KHZ => 2,
        BW_500KHZ => 4,
        _ => {
            error!("ERROR: unsupported bandwidth 0x{:02X}", bw);
            return Err(anyhow!("LGW_HAL_ERR"));
        }
    };

    /* Duration of 1 symbol */
    let t_symbol_us: u16 = (1u16 << sf) * 8 / bw_pow; /* 2^SF / BW , in microseconds */

    /* Packet parameters */
    let h: i32 = if !no_header { 1 } else { 0 };
    let de: i32 = if is_ppm_on(bw, sf as u32) { 1 } else { 0 };
    let n_bit_crc: i32 = if !no_crc { 16 } else { 0 };
    let sf_i = sf as i32;

    /* Number of symbols in the payload, the numerator may go negative on tiny frames */
    let numerator = 8 * size as i32 + n_bit_crc - 4 * sf_i + if sf >= 7 { 8 } else { 0 } + 20 * h;
    let n_symbol_payload = ((numerator.max(0) as f64) / (4 * (sf_i - 2 * de)) as f64).ceil() as u32 * (cr as u32 + 4);

    /* number of symbols in packet */
    let n_symbol = n_symbol_preamble as f64 + if sf >= 7 { 4.25 } else { 6.25 } + 8.0 + n_symbol_payload as f64;

    /* Duration of packet in microseconds */
    let toa_us = (n_symbol * t_symbol_us as f64) as u32;

    trace!("INFO: LoRa packet ToA: {} us (n_symbol:{}, t_symbol_us:{})", toa_us, n_symbol, t_symbol_us);

    Ok((toa_us, n_symbol, n_symbol_payload, t_symbol_us))
}

/// FSK packet time on air in ms: preamble, 3-byte sync word, length byte, payload and CRC.
pub fn fsk_packet_time_on_air_ms(datarate: u32, preamble: u16, size: u8, crc_en: bool) -> u32 {
    if datarate == 0 {
        return 0;
    }
    let bytes = preamble as u32 + 3 + 1 + size as u32 + if crc_en { 2 } else { 0 };
    let toa_ms = (8 * bytes) as f64 / datarate as f64 * 1e3;
    toa_ms as u32 + 1 /* add margin for rounding */
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{CR_LORA_4_5, CR_LORA_4_8};

    #[test]
    fn lora_correction_matches_reference() {
        assert_eq!(compute_rf_tx_timestamp_correction_us(0, 20, 7, 125, 5, true, false, 2_000_000), 4185);
        assert_eq!(compute_rf_tx_timestamp_correction_us(0, 10, 12, 125, 8, true, true, 1_000_000), 31282);
    }

    #[test]
    fn header_only_payload() {
        assert_eq!(compute_rf_tx_timestamp_correction_us(0, 0, 7, 500, 5, false, false, 0), 3726);
    }

    #[test]
    fn fsk_correction() {
        assert_eq!(compute_rf_tx_timestamp_correction_us(50000, 20, 0, 0, 0, true, false, 0), 3529);
    }

    #[test]
    fn unsupported_bandwidth_keeps_only_fixed_terms() {
        assert_eq!(compute_rf_tx_timestamp_correction_us(0, 10, 7, 62, 5, true, false, 1_000_000), 3538);
    }

    #[test]
    fn correction_is_pure_over_all_sizes() {
        for sf in 7..=12u32 {
            for bw in [125u32, 250, 500] {
                for size in 0..=255u32 {
                    let ppm = (bw == 125 && sf >= 11) || (bw == 250 && sf == 12);
                    let a = compute_rf_tx_timestamp_correction_us(0, size, sf, bw, 5, true, ppm, 8_000_000);
                    let b = compute_rf_tx_timestamp_correction_us(0, size, sf, bw, 5, true, ppm, 8_000_000);
                    assert_eq!(a, b);
                    assert!(a >= TX_START_DELAY_US);
                }
            }
        }
    }

    #[test]
    fn lora_time_on_air() {
        let (toa_us, n_symbol, n_payload, t_symbol) = lora_packet_time_on_air(BW_125KHZ, 7, CR_LORA_4_5, 8, false, false, 20).unwrap();
        assert_eq!(t_symbol, 1024);
        assert_eq!(n_payload, 35);
        assert_eq!(n_symbol, 55.25);
        assert_eq!(toa_us, 56576);

        /* empty frame at high SF must not underflow */
        let (toa_us, _, _, _) = lora_packet_time_on_air(BW_125KHZ, 12, CR_LORA_4_8, 8, true, true, 0).unwrap();
        assert!(toa_us > 0);

        assert!(lora_packet_time_on_air(0x07, 7, CR_LORA_4_5, 8, false, false, 20).is_err());
    }

    #[test]
    fn fsk_time_on_air() {
        /* 8 * (5 + 3 + 1 + 10 + 2) bits at 50 kbps = 3.36 ms */
        assert_eq!(fsk_packet_time_on_air_ms(50000, 5, 10, true), 4);
        assert_eq!(fsk_packet_time_on_air_ms(0, 5, 10, true), 0);
    }
}
