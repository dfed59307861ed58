//! WebSocket transport.
//!
//! Binary frames carry raw stream bytes; the framing layer above
//! reassembles RPC messages, so message boundaries on the socket do not
//! matter. A single protocol state serves both directions: reads take
//! the socket for one short timeout slice and hand it back, so a thread
//! waiting for data never pins the socket while another thread writes.

use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;
use tungstenite::{Message, WebSocket};

use crate::error::{Result, WireError};
use crate::transport::tcp::READ_SLICE;
use crate::transport::Transport;

fn ws_error(e: tungstenite::Error) -> WireError {
    match e {
        tungstenite::Error::Io(e) => WireError::Io(e),
        other => WireError::Protocol(format!("websocket: {other}")),
    }
}

fn would_block() -> WireError {
    WireError::Io(ErrorKind::WouldBlock.into())
}

pub struct WsTransport {
    url: String,
    socket: Mutex<Option<WebSocket<TcpStream>>>,
    raw: Mutex<Option<TcpStream>>,
    /// Bytes from a frame larger than the caller's buffer.
    pending: Mutex<Vec<u8>>,
    connected: AtomicBool,
}

impl WsTransport {
    /// Client-side transport for a `ws://host:port/path` url.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: Mutex::new(None),
            raw: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Perform the server side of the upgrade on an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let url = stream
            .peer_addr()
            .map(|a| format!("ws-peer://{a}"))
            .unwrap_or_else(|_| "ws-peer".to_owned());
        stream.set_nodelay(true)?;

        let raw = stream.try_clone()?;
        let socket = tungstenite::accept(stream)
            .map_err(|e| WireError::Protocol(format!("websocket accept: {e}")))?;
        raw.set_read_timeout(Some(READ_SLICE))?;

        Ok(Self {
            url,
            socket: Mutex::new(Some(socket)),
            raw: Mutex::new(Some(raw)),
            pending: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    fn authority(&self) -> Result<&str> {
        let rest = self
            .url
            .strip_prefix("ws://")
            .ok_or_else(|| WireError::Protocol(format!("bad websocket url: {}", self.url)))?;
        Ok(rest.split('/').next().unwrap_or(rest))
    }
}

impl Transport for WsTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let stream = TcpStream::connect(self.authority()?)?;
        stream.set_nodelay(true)?;
        let raw = stream.try_clone()?;

        // Handshake on the blocking socket, then switch to sliced reads.
        let (socket, _response) = tungstenite::client(self.url.as_str(), stream)
            .map_err(|e| WireError::Protocol(format!("websocket handshake: {e}")))?;
        raw.set_read_timeout(Some(READ_SLICE))?;

        *self.socket.lock() = Some(socket);
        *self.raw.lock() = Some(raw);
        self.pending.lock().clear();
        self.connected.store(true, Ordering::Release);
        debug!(url = %self.url, "websocket connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        // Shut the shared fd down instead of waiting on the socket lock,
        // which a mid-slice reader may hold.
        if let Some(raw) = self.raw.lock().take() {
            let _ = raw.shutdown(Shutdown::Both);
            debug!(url = %self.url, "websocket disconnected");
        }
    }

    /// Reads at most one frame per call. A timeout slice, an empty frame
    /// or a control frame returns a `WouldBlock` error so the caller
    /// retries while the socket lock is free for writers.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        {
            let mut pending = self.pending.lock();
            if !pending.is_empty() {
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending[..n]);
                pending.drain(..n);
                return Ok(n);
            }
        }

        let mut guard = self.socket.lock();
        let socket = match guard.as_mut() {
            Some(socket) => socket,
            None => return Ok(0),
        };

        let data = match socket.read() {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => return Ok(0),
            // Ping replies are queued on the protocol state and go out
            // under this same lock.
            Ok(_) => return Err(would_block()),
            Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => return Ok(0),
            Err(_) if !self.is_connected() => return Ok(0),
            Err(e) => return Err(ws_error(e)),
        };

        if data.is_empty() {
            return Err(would_block());
        }

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            self.pending.lock().extend_from_slice(&data[n..]);
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(WireError::NotConnected);
        }
        let mut guard = self.socket.lock();
        let socket = guard.as_mut().ok_or(WireError::NotConnected)?;
        socket.send(Message::Binary(data.to_vec())).map_err(ws_error)
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.socket.lock();
        let socket = guard.as_mut().ok_or(WireError::NotConnected)?;
        socket.flush().map_err(ws_error)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn read_retry(transport: &WsTransport, buf: &mut [u8]) -> usize {
        loop {
            match transport.read(buf) {
                Ok(n) => return n,
                Err(WireError::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    #[test]
    fn test_ws_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let transport = WsTransport::from_stream(stream).unwrap();
            let mut buf = [0u8; 64];
            let n = read_retry(&transport, &mut buf);
            transport.write(&buf[..n]).unwrap();
        });

        let client = WsTransport::new(format!("ws://{addr}/rpc"));
        client.connect().unwrap();
        client.write(b"over websocket").unwrap();

        let mut buf = [0u8; 64];
        let n = read_retry(&client, &mut buf);
        assert_eq!(&buf[..n], b"over websocket");

        server.join().unwrap();
        client.disconnect();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_oversized_frame_spills_into_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let transport = WsTransport::from_stream(stream).unwrap();
            transport.write(&[7u8; 10]).unwrap();
            // Hold the connection until the client is done reading.
            let mut buf = [0u8; 8];
            let _ = transport.read(&mut buf);
        });

        let client = WsTransport::new(format!("ws://{addr}/"));
        client.connect().unwrap();

        let mut buf = [0u8; 4];
        let mut total = Vec::new();
        while total.len() < 10 {
            let n = read_retry(&client, &mut buf);
            assert!(n > 0);
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, vec![7u8; 10]);

        client.disconnect();
        server.join().unwrap();
    }

    #[test]
    fn test_write_proceeds_while_reader_waits() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let transport = WsTransport::from_stream(stream).unwrap();
            let mut buf = [0u8; 64];
            let n = read_retry(&transport, &mut buf);
            transport.write(&buf[..n]).unwrap();
        });

        let client = std::sync::Arc::new(WsTransport::new(format!("ws://{addr}/")));
        client.connect().unwrap();

        // Start waiting for the echo before anything has been sent, so
        // the write below must interleave with an in-progress read.
        let reading = std::sync::Arc::clone(&client);
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let n = read_retry(&reading, &mut buf);
            buf[..n].to_vec()
        });

        std::thread::sleep(Duration::from_millis(50));
        client.write(b"late write").unwrap();

        assert_eq!(reader.join().unwrap(), b"late write");
        server.join().unwrap();
        client.disconnect();
    }

    #[test]
    fn test_bad_url_rejected() {
        let client = WsTransport::new("http://example/");
        assert!(client.connect().is_err());
    }
}
