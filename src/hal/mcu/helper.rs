use anyhow::{anyhow, Result};

pub fn bytes_be_to_uint32(bytes: &[u8]) -> Result<u32> {
    match bytes {
        [b0, b1, b2, b3, ..] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => Err(anyhow!("ERROR: bytes_be_to_uint32: bytes.len() < 4")),
    }
}

pub fn bytes_be_to_uint16(bytes: &[u8]) -> Result<u16> {
    match bytes {
        [b0, b1, ..] => Ok(u16::from_be_bytes([*b0, *b1])),
        _ => Err(anyhow!("ERROR: bytes_be_to_uint16: bytes.len() < 2")),
    }
}
