//! Local IPC transport over Unix domain sockets.

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, WireError};
use crate::transport::Transport;

pub struct PipeTransport {
    path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
    connected: AtomicBool,
}

impl PipeTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Wrap an already accepted stream (server side).
    pub fn from_stream(stream: UnixStream, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
        }
    }

    fn handle(&self) -> Result<UnixStream> {
        let guard = self.stream.lock();
        match guard.as_ref() {
            Some(stream) => Ok(stream.try_clone()?),
            None => Err(WireError::NotConnected),
        }
    }
}

impl Transport for PipeTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = UnixStream::connect(&self.path)?;
        *self.stream.lock() = Some(stream);
        self.connected.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "pipe connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(path = %self.path.display(), "pipe disconnected");
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
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
        format!("pipe://{}", self.path.display())
    }

    fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        let guard = self.stream.lock();
        if let Some(stream) = guard.as_ref() {
            stream.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        let guard = self.stream.lock();
        if let Some(stream) = guard.as_ref() {
            stream.set_write_timeout(timeout)?;
        }
        Ok(())
    }
}
