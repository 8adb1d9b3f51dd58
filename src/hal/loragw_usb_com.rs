use std::io::{Read, Write};
use std::time::Duration;

use serialport::{FlowControl, Parity, SerialPort, StopBits};

use anyhow::Result;
use tracing::trace;

const USB_COM_BAUDRATE: u32 = 115200;
const USB_COM_TIMEOUT_MS: u64 = 5000;

pub struct UsbComPort {
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for UsbComPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UsbComPort {{ open: {} }}", self.port.is_some())
    }
}

impl UsbComPort {
    pub fn new() -> Self {
        Self { port: None }
    }

    pub fn open(&mut self, port_name: &str) -> Result<()> {
        let port = serialport::new(port_name, USB_COM_BAUDRATE)
            .flow_control(FlowControl::None)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(USB_COM_TIMEOUT_MS))
            .open()?;

        self.port = Some(port);
        Ok(())
    }

    pub fn close(&mut self) {
        self.port = None;
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, std::io::Error> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "Port not open"))
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        trace!(size=%data.len(), "WR: {:02X?}", data);
        self.port()?.write_all(data)
    }

    pub fn read_exact(&mut self, data: &mut [u8]) -> Result<(), std::io::Error> {
        self.port()?.read_exact(data)?;
        trace!("RD: {:02X?}", data);
        Ok(())
    }
}

impl Default for UsbComPort {
    fn default() -> Self {
        Self::new()
    }
}
