use anyhow::{anyhow, Result};

use super::helper;

/// Bus and timing primitives a radio driver is given by its owner.
///
/// The SPI transfer is full duplex and in place: `buf` holds the bytes to
/// clock out and is overwritten with the bytes clocked in.
pub trait RadioCom {
    fn spi_transfer(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Drives the radio reset line; `active` asserts reset.
    fn set_reset(&mut self, active: bool) -> Result<()>;

    fn micros(&self) -> u64 {
        helper::monotonic_us()
    }

    fn delay_ms(&mut self, ms: u32) {
        helper::wait_ms(ms)
    }
}

impl<T: RadioCom + ?Sized> RadioCom for Box<T> {
    fn spi_transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).spi_transfer(buf)
    }

    fn set_reset(&mut self, active: bool) -> Result<()> {
        (**self).set_reset(active)
    }

    fn micros(&self) -> u64 {
        (**self).micros()
    }

    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

/// Register-map access (7-bit address, MSB set for writes) on top of [`RadioCom`].
pub trait LoragwComTrait {
    fn lgw_com_r(&mut self, address: u8) -> Result<u8>;
    fn lgw_com_w(&mut self, address: u8, value: u8) -> Result<()>;
    fn lgw_com_rmw(&mut self, address: u8, offs: u8, leng: u8, value: u8) -> Result<()>;
    fn lgw_com_rb(&mut self, address: u8, data: &mut [u8]) -> Result<()>;
    fn lgw_com_wb(&mut self, address: u8, data: &[u8]) -> Result<()>;
}

impl<T: RadioCom + ?Sized> LoragwComTrait for T {
    /* Simple read */
    fn lgw_com_r(&mut self, address: u8) -> Result<u8> {
        let mut buf = [address & 0x7F, 0x00];
        self.spi_transfer(&mut buf)?;
        Ok(buf[1])
    }

    fn lgw_com_w(&mut self, address: u8, value: u8) -> Result<()> {
        let mut buf = [0x80 | (address & 0x7F), value];
        self.spi_transfer(&mut buf)
    }

    /* Read-modify-write of `leng` bits starting at bit `offs` */
    fn lgw_com_rmw(&mut self, address: u8, offs: u8, leng: u8, value: u8) -> Result<()> {
        if leng == 0 || offs + leng > 8 {
            return Err(anyhow!("ERROR: invalid bit field (offs:{} leng:{})", offs, leng));
        }
        let mask = (((1u16 << leng) - 1) as u8) << offs;
        let current = self.lgw_com_r(address)?;
        let next = (current & !mask) | ((value << offs) & mask);
        self.lgw_com_w(address, next)
    }

    /* Burst (multiple-byte) read */
    fn lgw_com_rb(&mut self, address: u8, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Err(anyhow!("ERROR: empty data array"));
        }
        let mut buf = vec![0u8; data.len() + 1];
        buf[0] = address & 0x7F;
        self.spi_transfer(&mut buf)?;
        data.copy_from_slice(&buf[1..]);
        Ok(())
    }

    fn lgw_com_wb(&mut self, address: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(anyhow!("ERROR: empty data array"));
        }
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(0x80 | (address & 0x7F));
        buf.extend_from_slice(data);
        self.spi_transfer(&mut buf)
    }
}
