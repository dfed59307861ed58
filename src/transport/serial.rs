//! Serial port transport.
//!
//! Endpoint strings give the port plus optional line settings, for example
//! `/dev/ttyUSB0,115200,8,N,1` or `COM3,9600`. Defaults are 115200 baud,
//! eight data bits, no parity, one stop bit.
//!
//! Serial reads cannot be unblocked by closing the port from another
//! thread, so reads run with a short driver timeout and poll the connected
//! flag between slices.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::error::{Result, WireError};
use crate::transport::tcp::READ_SLICE;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SerialSettings {
    port: String,
    baud: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
}

impl SerialSettings {
    /// Parse `port[,baud[,databits[,parity[,stopbits]]]]`.
    fn parse(endpoint: &str) -> Result<Self> {
        let mut parts = endpoint.split(',').map(str::trim);

        let port = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| WireError::Protocol(format!("bad serial endpoint: {endpoint:?}")))?
            .to_owned();

        let mut settings = Self {
            port,
            baud: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        };

        let bad = |what: &str| WireError::Protocol(format!("bad serial {what} in {endpoint:?}"));

        if let Some(baud) = parts.next() {
            settings.baud = baud.parse().map_err(|_| bad("baud rate"))?;
        }
        if let Some(bits) = parts.next() {
            settings.data_bits = match bits {
                "5" => DataBits::Five,
                "6" => DataBits::Six,
                "7" => DataBits::Seven,
                "8" => DataBits::Eight,
                _ => return Err(bad("data bits")),
            };
        }
        if let Some(parity) = parts.next() {
            settings.parity = match parity {
                "N" | "n" => Parity::None,
                "E" | "e" => Parity::Even,
                "O" | "o" => Parity::Odd,
                _ => return Err(bad("parity")),
            };
        }
        if let Some(stop) = parts.next() {
            settings.stop_bits = match stop {
                "1" => StopBits::One,
                "2" => StopBits::Two,
                _ => return Err(bad("stop bits")),
            };
        }

        Ok(settings)
    }
}

pub struct SerialTransport {
    settings: SerialSettings,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    connected: AtomicBool,
}

impl SerialTransport {
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            settings: SerialSettings::parse(endpoint)?,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }
}

impl Transport for SerialTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let s = &self.settings;
        let port = serialport::new(&s.port, s.baud)
            .data_bits(s.data_bits)
            .parity(s.parity)
            .stop_bits(s.stop_bits)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| WireError::Protocol(format!("cannot open {}: {e}", s.port)))?;

        let writer = port
            .try_clone()
            .map_err(|e| WireError::Protocol(format!("cannot clone {}: {e}", s.port)))?;

        *self.reader.lock() = Some(port);
        *self.writer.lock() = Some(writer);
        self.connected.store(true, Ordering::Release);
        debug!(port = %s.port, baud = s.baud, "serial connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.reader.lock().take();
        self.writer.lock().take();
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        // One driver-timeout slice per call; the caller retries on the
        // TimedOut/WouldBlock it maps through, so a disconnect from another
        // thread is observed between slices.
        let result = {
            let mut guard = self.reader.lock();
            match guard.as_mut() {
                Some(port) => port.read(buf),
                None => return Ok(0),
            }
        };

        match result {
            Ok(n) => Ok(n),
            Err(_) if !self.is_connected() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(WireError::NotConnected)?;
        port.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(WireError::NotConnected)?;
        port.flush()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> String {
        format!("serial://{}@{}", self.settings.port, self.settings.baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        let s = SerialSettings::parse("/dev/ttyUSB0,9600,7,E,2").unwrap();
        assert_eq!(s.port, "/dev/ttyUSB0");
        assert_eq!(s.baud, 9600);
        assert_eq!(s.data_bits, DataBits::Seven);
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.stop_bits, StopBits::Two);

        let s = SerialSettings::parse("COM3").unwrap();
        assert_eq!(s.port, "COM3");
        assert_eq!(s.baud, 115_200);
        assert_eq!(s.parity, Parity::None);
    }

    #[test]
    fn test_bad_endpoints_fail() {
        assert!(SerialSettings::parse("").is_err());
        assert!(SerialSettings::parse("COM3,notanumber").is_err());
        assert!(SerialSettings::parse("COM3,9600,9").is_err());
        assert!(SerialSettings::parse("COM3,9600,8,X").is_err());
    }
}
