/// Radio driver status, numbered like the RadioLib status codes the
/// configuration and logs of single-channel gateways refer to.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("ERR_UNKNOWN_CHIP_MODEL")]
    UnknownChipModel,

    #[error("ERR_CHIP_NOT_FOUND")]
    ChipNotFound,

    #[error("ERR_PACKET_TOO_LONG")]
    PacketTooLong,

    #[error("ERR_TX_TIMEOUT")]
    TxTimeout,

    #[error("ERR_RX_TIMEOUT")]
    RxTimeout,

    #[error("ERR_CRC_MISMATCH")]
    CrcMismatch,

    #[error("ERR_INVALID_BANDWIDTH")]
    InvalidBandwidth,

    #[error("ERR_INVALID_SPREADING_FACTOR")]
    InvalidSpreadingFactor,

    #[error("ERR_INVALID_CODING_RATE")]
    InvalidCodingRate,

    #[error("ERR_INVALID_FREQUENCY")]
    InvalidFrequency,

    #[error("ERR_INVALID_OUTPUT_POWER")]
    InvalidOutputPower,

    #[error("ERR_SPI_WRITE_FAILED")]
    SpiWriteFailed,

    #[error("ERR_INVALID_CURRENT_LIMIT")]
    InvalidCurrentLimit,

    #[error("ERR_INVALID_PREAMBLE_LENGTH")]
    InvalidPreambleLength,

    #[error("ERR_LORA_HEADER_DAMAGED")]
    LoraHeaderDamaged,

    #[error("ERR_INVALID_BIT_RATE")]
    InvalidBitRate,

    #[error("ERR_INVALID_FREQUENCY_DEVIATION")]
    InvalidFrequencyDeviation,
}

impl Error {
    pub fn code(&self) -> i16 {
        match self {
            Error::UnknownChipModel => -1,
            Error::ChipNotFound => -2,
            Error::PacketTooLong => -4,
            Error::TxTimeout => -5,
            Error::RxTimeout => -6,
            Error::CrcMismatch => -7,
            Error::InvalidBandwidth => -8,
            Error::InvalidSpreadingFactor => -9,
            Error::InvalidCodingRate => -10,
            Error::InvalidFrequency => -12,
            Error::InvalidOutputPower => -13,
            Error::SpiWriteFailed => -16,
            Error::InvalidCurrentLimit => -17,
            Error::InvalidPreambleLength => -18,
            Error::LoraHeaderDamaged => -24,
            Error::InvalidBitRate => -101,
            Error::InvalidFrequencyDeviation => -102,
        }
    }

    /// Errors that only mean "nothing usable arrived", as opposed to a chip fault.
    pub fn is_reception_miss(&self) -> bool {
        matches!(self, Error::RxTimeout | Error::CrcMismatch | Error::LoraHeaderDamaged)
    }
}
