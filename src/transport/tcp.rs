//! TCP and UDP transports.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, WireError};
use crate::transport::Transport;

/// Poll interval for transports whose reads cannot be unblocked by a
/// close from another thread.
pub(crate) const READ_SLICE: Duration = Duration::from_millis(200);

/// Stream transport over TCP. Nagle is disabled so small RPC frames go out
/// immediately.
pub struct TcpTransport {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Wrap an already accepted stream (server side).
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp-peer".to_owned());
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            stream: Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
        })
    }

    fn handle(&self) -> Result<TcpStream> {
        let guard = self.stream.lock();
        match guard.as_ref() {
            Some(stream) => Ok(stream.try_clone()?),
            None => Err(WireError::NotConnected),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;
        *self.stream.lock() = Some(stream);
        self.connected.store(true, Ordering::Release);
        debug!(endpoint = %self.addr, "tcp connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(endpoint = %self.addr, "tcp disconnected");
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        // Read outside the lock so disconnect can take it. A shutdown from
        // another thread makes this read return 0.
        let mut stream = self.handle()?;
        match stream.read(buf) {
            Ok(n) => Ok(n),
            Err(_) if !self.is_connected() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut stream = self.handle()?;
        stream.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut stream = self.handle()?;
        stream.flush()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let guard = self.stream.lock();
        if let Some(stream) = guard.as_ref() {
            stream.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let guard = self.stream.lock();
        if let Some(stream) = guard.as_ref() {
            stream.set_write_timeout(timeout)?;
        }
        Ok(())
    }
}

/// Datagram transport over a connected UDP socket. One datagram carries one
/// chunk of the stream; framing above reassembles messages.
pub struct UdpTransport {
    local: String,
    remote: String,
    socket: Mutex<Option<UdpSocket>>,
    connected: AtomicBool,
}

impl UdpTransport {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            socket: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }
}

impl Transport for UdpTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let socket = UdpSocket::bind(&self.local)?;
        socket.connect(&self.remote)?;
        socket.set_read_timeout(Some(READ_SLICE))?;
        *self.socket.lock() = Some(socket);
        self.connected.store(true, Ordering::Release);
        debug!(local = %self.local, remote = %self.remote, "udp connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.socket.lock().take();
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let socket = {
            let guard = self.socket.lock();
            match guard.as_ref() {
                Some(socket) => socket.try_clone()?,
                None => return Ok(0),
            }
        };

        // Reads run in timeout slices so a disconnect from another thread is
        // observed; the caller retries on WouldBlock.
        match socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(_) if !self.is_connected() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(WireError::NotConnected)?;
        socket.send(data)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> String {
        format!("udp://{}", self.remote)
    }
}
