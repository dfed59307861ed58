//! Byte transports the connector runs over.
//!
//! A [`Transport`] is a connected, bidirectional byte stream. Methods take
//! `&self` so one thread can sit in [`Transport::read`] while another calls
//! [`Transport::write`] or [`Transport::disconnect`]; `disconnect` must
//! unblock a pending read.

use std::time::Duration;

use crate::error::Result;

/// Default write chunk size when a transport does not report its own.
pub const DEFAULT_SEND_BUFFER: usize = 64 * 1024;

pub mod pipe;
pub mod serial;
pub mod tcp;
pub mod ws;

pub use serial::SerialTransport;
pub use tcp::{TcpTransport, UdpTransport};
pub use ws::WsTransport;

#[cfg(unix)]
pub use pipe::PipeTransport;

/// A connected byte stream.
pub trait Transport: Send + Sync {
    /// Establish the underlying connection.
    fn connect(&self) -> Result<()>;

    /// Tear the connection down, unblocking any thread stuck in `read`.
    fn disconnect(&self);

    /// Read available bytes. Blocks until data arrives; returns `Ok(0)` when
    /// the peer closed or the transport was disconnected. Transports that
    /// read in timeout slices surface `WouldBlock`/`TimedOut` I/O errors,
    /// which callers retry.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Push buffered output down to the device.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Largest chunk a single `write` should carry. The connector splits
    /// frames accordingly.
    fn send_buffer_size(&self) -> usize {
        DEFAULT_SEND_BUFFER
    }

    fn is_connected(&self) -> bool;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;

    /// Bound the blocking time of `read`. `None` blocks indefinitely.
    /// Transports without timeout support ignore this.
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    /// Bound the blocking time of `write`. Transports without timeout
    /// support ignore this.
    fn set_write_timeout(&self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }
}
