pub mod command;
mod helper;

use anyhow::{anyhow, Result};
use command::*;
use rand::Rng;
use tracing::{debug, error, info, trace};

use super::loragw_com::RadioCom;
use super::loragw_usb_com::UsbComPort;

const MAX_SIZE_COMMAND: usize = 4200;
const MAX_SPI_COMMAND: usize = MAX_SIZE_COMMAND - HEADER_CMD_SIZE - 1;

const HEADER_CMD_SIZE: usize = 4;

/// Byte transport under the bridge protocol.
pub trait ComLink {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn read_exact(&mut self, data: &mut [u8]) -> std::io::Result<()>;
}

impl ComLink for UsbComPort {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        UsbComPort::write_all(self, data)
    }

    fn read_exact(&mut self, data: &mut [u8]) -> std::io::Result<()> {
        UsbComPort::read_exact(self, data)
    }
}

#[derive(Debug)]
pub struct PingInfo {
    pub unique_id_high: u32,
    pub unique_id_mid: u32,
    pub unique_id_low: u32,
    pub version: String, /* format is V00.00.00 */
}

#[derive(Debug)]
pub struct Status {
    pub system_time_ms: u32,
    pub temperature: f32,
}

impl Status {
    pub fn from_get_status(payload: &[u8]) -> Result<Status> {
        if payload.len() < ECmdOffsetAckGetStatus::AckGetStatusSize as usize {
            return Err(anyhow!("ERROR: short GET_STATUS ack ({} bytes)", payload.len()));
        }

        let raw_temp = helper::bytes_be_to_uint16(&payload[ECmdOffsetAckGetStatus::AckGetStatusTemperature15_8 as usize..])?;
        Ok(Status {
            system_time_ms: helper::bytes_be_to_uint32(&payload[ECmdOffsetAckGetStatus::AckGetStatusSystemTime31_24 as usize..])?,
            temperature: raw_temp as f32 / 100.0,
        })
    }
}

impl PingInfo {
    pub fn from_ping(payload: &[u8]) -> Result<PingInfo> {
        if payload.len() < ECmdOffsetAckPing::AckPingSize as usize {
            return Err(anyhow!("ERROR: short PING ack ({} bytes)", payload.len()));
        }

        let version = &payload[ECmdOffsetAckPing::AckPingVersion0 as usize..ECmdOffsetAckPing::AckPingSize as usize];
        Ok(PingInfo {
            unique_id_high: helper::bytes_be_to_uint32(&payload[ECmdOffsetAckPing::AckPingUniqueId0 as usize..])?,
            unique_id_mid: helper::bytes_be_to_uint32(&payload[ECmdOffsetAckPing::AckPingUniqueId4 as usize..])?,
            unique_id_low: helper::bytes_be_to_uint32(&payload[ECmdOffsetAckPing::AckPingUniqueId8 as usize..])?,
            version: String::from_utf8_lossy(version).trim_end_matches('\0').to_string(),
        })
    }
}

/// USB bridge MCU driving one radio's SPI bus and reset line.
#[derive(Debug)]
pub struct Mcu<L = UsbComPort> {
    pub com: L,
    pub ping_info: Option<PingInfo>,
    pub status: Option<Status>,
    spi_target: ECmdSpiTarget,
    reset_pin: Option<u8>,
}

impl Mcu<UsbComPort> {
    pub fn new(spi_target: ECmdSpiTarget, reset_pin: Option<u8>) -> Self {
        Self::with_link(UsbComPort::new(), spi_target, reset_pin)
    }

    pub fn open(&mut self, port_name: &str) -> Result<()> {
        self.com.open(port_name)?;
        self.handshake()
    }

    pub fn close(&mut self) {
        self.com.close();
    }
}

impl<L: ComLink> Mcu<L> {
    pub fn with_link(com: L, spi_target: ECmdSpiTarget, reset_pin: Option<u8>) -> Self {
        Self {
            com,
            ping_info: None,
            status: None,
            spi_target,
            reset_pin,
        }
    }

    pub fn handshake(&mut self) -> Result<()> {
        let ping_info = self.mcu_ping()?;
        info!(
            "INFO: bridge MCU firmware {} (id {:08X}{:08X}{:08X})",
            ping_info.version, ping_info.unique_id_high, ping_info.unique_id_mid, ping_info.unique_id_low
        );
        self.ping_info = Some(ping_info);

        let status = self.get_mcu_status()?;
        debug!("INFO: bridge MCU temperature {:.1}C, uptime {} ms", status.temperature, status.system_time_ms);
        self.status = Some(status);

        Ok(())
    }

    fn write_req(&mut self, order: OrderId, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_SPI_COMMAND {
            return Err(anyhow!("Data too long"));
        }

        let mut frame = Vec::with_capacity(HEADER_CMD_SIZE + payload.len());
        frame.push(rand::rng().random::<u8>());
        frame.push((payload.len() >> 8) as u8); // MSB
        frame.push((payload.len() & 0xFF) as u8); // LSB
        frame.push(order as u8);
        frame.extend_from_slice(payload);

        self.com
            .write_all(&frame)
            .map_err(|e| anyhow!("Failed to write to serial port: {}", e))?;

        trace!("write_req done");
        Ok(())
    }

    fn read_ack(&mut self, order: OrderId) -> Result<Vec<u8>> {
        let mut hdr = [0u8; HEADER_CMD_SIZE];
        self.com.read_exact(&mut hdr).map_err(|e| anyhow!("Failed to read HDR: {}", e))?;

        trace!("READ HD: {:02X?}", hdr);

        if hdr[CommandOrderOffset::Cmd as usize] != order.ack() {
            return Err(anyhow!(
                "ERROR: received wrong ACK type (expected:0x{:02X}, got 0x{:02X})",
                order.ack(),
                hdr[CommandOrderOffset::Cmd as usize]
            ));
        }

        let size = (((hdr[CommandOrderOffset::SizeMsb as usize] as u16) << 8) | (hdr[CommandOrderOffset::SizeLsb as usize] as u16)) as usize;
        trace!("READ SIZE: {:}", size);

        let mut payload = vec![0u8; size];
        if size > 0 {
            self.com.read_exact(&mut payload).map_err(|e| anyhow!("Failed to read Payload: {}", e))?;
        }

        Ok(payload)
    }

    pub fn mcu_ping(&mut self) -> Result<PingInfo> {
        self.write_req(OrderId::ReqPing, &[])?;
        let payload = self.read_ack(OrderId::ReqPing)?;
        PingInfo::from_ping(&payload)
    }

    pub fn get_mcu_status(&mut self) -> Result<Status> {
        self.write_req(OrderId::ReqGetStatus, &[])?;
        let payload = self.read_ack(OrderId::ReqGetStatus)?;
        Status::from_get_status(&payload)
    }

    pub fn mcu_gpio_write(&mut self, gpio_port: u8, gpio_id: u8, gpio_value: u8) -> Result<()> {
        let mut buf_req = [0u8; ECmdOffsetReqWriteGpio::ReqWriteGpioSize as usize];

        buf_req[ECmdOffsetReqWriteGpio::ReqWriteGpioPort as usize] = gpio_port;
        buf_req[ECmdOffsetReqWriteGpio::ReqWriteGpioPin as usize] = gpio_id;
        buf_req[ECmdOffsetReqWriteGpio::ReqWriteGpioState as usize] = gpio_value;

        self.write_req(OrderId::ReqWriteGpio, &buf_req)?;
        let payload = self.read_ack(OrderId::ReqWriteGpio)?;

        let status = payload
            .get(ECmdOffsetAckGpioWrite::AckGpioWriteStatus as usize)
            .copied()
            .ok_or_else(|| anyhow!("ERROR: empty GPIO ack"))?;
        if status != 0 {
            return Err(anyhow!("ERROR: Failed to write GPIO (port:{} id:{} value:{})", gpio_port, gpio_id, gpio_value));
        }

        Ok(())
    }

    /// One full-duplex SPI frame on this bridge's radio target.
    pub fn mcu_spi_transfer(&mut self, raw: &mut [u8]) -> Result<()> {
        if raw.is_empty() {
            return Err(anyhow!("Input buffer is null"));
        }

        let mut req = Vec::with_capacity(MCU_SPI_REQ_HEADER_SIZE + raw.len());
        req.push(0); /* Req ID */
        req.push(MCU_SPI_REQ_TYPE_READ_WRITE); /* Req type */
        req.push(self.spi_target as u8); /* MCU -> RADIO */
        req.push((raw.len() >> 8) as u8);
        req.push((raw.len() & 0xFF) as u8);
        req.extend_from_slice(raw);

        self.write_req(OrderId::ReqMultipleSpi, &req)?;
        let payload = self.read_ack(OrderId::ReqMultipleSpi)?;

        Self::decode_ack_spi(&payload, raw)
    }

    fn decode_ack_spi(payload: &[u8], raw: &mut [u8]) -> Result<()> {
        if payload.len() < MCU_SPI_REQ_HEADER_SIZE + raw.len() {
            return Err(anyhow!("ERROR: short SPI ack ({} bytes for a {} bytes frame)", payload.len(), raw.len()));
        }

        let req_type = payload[1];
        if req_type != MCU_SPI_REQ_TYPE_READ_WRITE {
            return Err(anyhow!("ERROR: wrong type for SPI request {} (0x{:02X})", payload[0], req_type));
        }

        let req_status = ESpiStatus::from(payload[2]);
        if req_status != ESpiStatus::SpiStatusOk {
            return Err(anyhow!("ERROR: SPI request {} failed with {}", payload[0], req_status));
        }

        let frame_size = helper::bytes_be_to_uint16(&payload[3..])? as usize;
        if frame_size != raw.len() {
            return Err(anyhow!("ERROR: SPI ack frame size {} does not match request {}", frame_size, raw.len()));
        }

        raw.copy_from_slice(&payload[MCU_SPI_REQ_HEADER_SIZE..MCU_SPI_REQ_HEADER_SIZE + frame_size]);
        Ok(())
    }
}

impl<L: ComLink> RadioCom for Mcu<L> {
    fn spi_transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        self.mcu_spi_transfer(buf).map_err(|e| {
            error!(e=%e, "ERROR: USB SPI TRANSFER FAILURE");
            e
        })
    }

    /* NRESET is active low */
    fn set_reset(&mut self, active: bool) -> Result<()> {
        match self.reset_pin {
            Some(pin) => self.mcu_gpio_write(MCU_GPIO_PORT_RADIO, pin, if active { 0 } else { 1 }),
            None => Ok(()),
        }
    }
}
