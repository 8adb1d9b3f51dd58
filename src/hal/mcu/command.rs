use std::fmt::Display;

/* Orders understood by the USB bridge firmware; ACKs echo the order with bit 6 set */
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum OrderId {
    ReqPing            = 0x00,
    ReqGetStatus       = 0x01,
    ReqWriteGpio       = 0x04,
    ReqMultipleSpi     = 0x05,

    AckPing            = 0x40,
    AckGetStatus       = 0x41,
    AckWriteGpio       = 0x44,
    AckMultipleSpi     = 0x45,
}

impl OrderId {
    pub fn ack(self) -> u8 {
        (self as u8) | 0x40
    }
}

#[repr(u8)]
pub enum CommandOrderOffset {
    Id,
    SizeMsb,
    SizeLsb,
    Cmd,
}

#[repr(u8)]
pub enum ECmdOffsetAckPing {
    AckPingUniqueId0 = 0,
    AckPingUniqueId4 = 4,
    AckPingUniqueId8 = 8,
    AckPingVersion0 = 12,
    AckPingSize = 21,
}

#[repr(u8)]
pub enum ECmdOffsetAckGetStatus {
    AckGetStatusSystemTime31_24, AckGetStatusSystemTime23_16, AckGetStatusSystemTime15_8, AckGetStatusSystemTime7_0,
    AckGetStatusTemperature15_8, AckGetStatusTemperature7_0,
    AckGetStatusSize,
}

#[repr(u8)]
pub enum ECmdOffsetReqWriteGpio {
    ReqWriteGpioPort,
    ReqWriteGpioPin,
    ReqWriteGpioState,
    ReqWriteGpioSize,
}

#[repr(u8)]
pub enum ECmdOffsetAckGpioWrite {
    AckGpioWriteStatus,
    AckGpioWriteSize,
}

/* SPI request: [id, type, target, size msb, size lsb, raw frame...]
   SPI ack:     [id, type, status, size msb, size lsb, raw frame...] */
pub const MCU_SPI_REQ_HEADER_SIZE: usize = 5;
pub const MCU_SPI_REQ_TYPE_READ_WRITE: u8 = 0x01; /* Read/Write SPI request */

pub const MCU_GPIO_PORT_RADIO: u8 = 0; /* radio control lines sit on port A */

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum ESpiStatus {
    SpiStatusOk,
    SpiStatusFail,
    SpiStatusWrongParam,
    SpiStatusTimeout,
    SpiStatusUnknown,
}

impl From<u8> for ESpiStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ESpiStatus::SpiStatusOk,
            1 => ESpiStatus::SpiStatusFail,
            2 => ESpiStatus::SpiStatusWrongParam,
            3 => ESpiStatus::SpiStatusTimeout,
            _ => ESpiStatus::SpiStatusUnknown,
        }
    }
}

impl Display for ESpiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ESpiStatus::SpiStatusOk => write!(f, "SpiStatusOk"),
            ESpiStatus::SpiStatusFail => write!(f, "SpiStatusFail"),
            ESpiStatus::SpiStatusWrongParam => write!(f, "SpiStatusWrongParam"),
            ESpiStatus::SpiStatusTimeout => write!(f, "SpiStatusTimeout"),
            ESpiStatus::SpiStatusUnknown => write!(f, "SpiStatusUnknown"),
        }
    }
}

/// SPI chip-select line of the bridge, one per radio slot.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ECmdSpiTarget {
    MCU_SPI_TARGET_RADIO0,
    MCU_SPI_TARGET_RADIO1,
}

impl ECmdSpiTarget {
    pub fn from_channel(channel: u8) -> Option<Self> {
        match channel {
            0 => Some(ECmdSpiTarget::MCU_SPI_TARGET_RADIO0),
            1 => Some(ECmdSpiTarget::MCU_SPI_TARGET_RADIO1),
            _ => None,
        }
    }
}
