//! Connection lifecycle over a [`Transport`].
//!
//! A [`Connector`] owns one transport and, while active, one dedicated read
//! thread. Inbound bytes run through a [`FrameBuffer`] and complete frames
//! go to the [`DataListener`] on the read thread, in arrival order.
//! Application-facing connection events ([`ConnectorListener`]) are
//! scheduled on the [`WorkerPool`] so a slow callback never stalls the read
//! loop.
//!
//! With `set_reconnect(true)` a lost connection is retried forever until
//! [`Connector::deactivate`]. Each loss fires `connection_closed(lost =
//! true)` exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WireError};
use crate::pool::WorkerPool;
use crate::protocol::framing::{FrameBuffer, Sizer};
use crate::transport::Transport;

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Default read and write timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 64 * 1024;

/// Lifecycle of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

/// Application-facing connection events, run on the worker pool.
pub trait ConnectorListener: Send + Sync {
    fn connection_established(&self, _connector: &Connector) {}

    /// `lost` is true when the peer dropped the connection, false on a local
    /// [`Connector::deactivate`].
    fn connection_closed(&self, _lost: bool) {}
}

/// Frame consumer, run synchronously on the read thread so frame order is
/// the arrival order.
pub trait DataListener: Send + Sync {
    /// A connection session begins; runs before any `data_received` of that
    /// session. Per-session state (type tables and the like) resets here.
    fn session_started(&self) {}

    fn data_received(&self, connector: &Connector, frame: Bytes);

    /// The session is over; no more frames will follow until the next
    /// `session_started`.
    fn session_ended(&self, _lost: bool) {}
}

type SizerFactory = Arc<dyn Fn() -> Sizer + Send + Sync>;

struct Config {
    reconnect: bool,
    read_timeout: Duration,
    write_timeout: Duration,
}

struct Shared {
    transport: Box<dyn Transport>,
    pool: Arc<WorkerPool>,
    state: Mutex<ConnectorState>,
    config: Mutex<Config>,
    listener: Mutex<Option<Arc<dyn ConnectorListener>>>,
    data_listener: Mutex<Option<Arc<dyn DataListener>>>,
    sizer_factory: Mutex<Option<SizerFactory>>,
    /// Reassembly buffer for the pull-mode [`Connector::read`].
    frames: Mutex<Option<FrameBuffer>>,
    /// Serializes whole frames onto the transport.
    write_lock: Mutex<()>,
    stop: AtomicBool,
    /// Suppresses duplicate close notifications within one session.
    notified_closed: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap handle to one shared connection; clones refer to the same state.
#[derive(Clone)]
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    pub fn new(transport: Box<dyn Transport>, pool: Arc<WorkerPool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                pool,
                state: Mutex::new(ConnectorState::Disconnected),
                config: Mutex::new(Config {
                    reconnect: false,
                    read_timeout: DEFAULT_IO_TIMEOUT,
                    write_timeout: DEFAULT_IO_TIMEOUT,
                }),
                listener: Mutex::new(None),
                data_listener: Mutex::new(None),
                sizer_factory: Mutex::new(None),
                frames: Mutex::new(None),
                write_lock: Mutex::new(()),
                stop: AtomicBool::new(false),
                notified_closed: AtomicBool::new(true),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn ConnectorListener>) {
        *self.shared.listener.lock() = Some(listener);
    }

    pub fn set_data_listener(&self, listener: Arc<dyn DataListener>) {
        *self.shared.data_listener.lock() = Some(listener);
    }

    /// Install the framing rule. The factory is invoked once per connection
    /// session, since a sizer may keep state.
    pub fn set_sizer<F>(&self, factory: F)
    where
        F: Fn() -> Sizer + Send + Sync + 'static,
    {
        *self.shared.sizer_factory.lock() = Some(Arc::new(factory));
    }

    pub fn set_reconnect(&self, reconnect: bool) {
        self.shared.config.lock().reconnect = reconnect;
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.shared.config.lock().read_timeout = timeout;
    }

    pub fn set_write_timeout(&self, timeout: Duration) {
        self.shared.config.lock().write_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Duration {
        self.shared.config.lock().read_timeout
    }

    pub fn state(&self) -> ConnectorState {
        *self.shared.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectorState::Connected
    }

    pub fn endpoint(&self) -> String {
        self.shared.transport.endpoint()
    }

    /// Connect and start the read loop. Returns false when the initial
    /// connect fails and reconnect is off, or when already active.
    pub fn activate(&self) -> bool {
        {
            let mut state = self.shared.state.lock();
            if *state != ConnectorState::Disconnected {
                debug!(endpoint = %self.endpoint(), "already active");
                return false;
            }
            *state = ConnectorState::Connecting;
        }

        self.shared.stop.store(false, Ordering::Release);

        if let Err(e) = self.shared.transport.connect() {
            if !self.shared.config.lock().reconnect {
                error!(endpoint = %self.endpoint(), error = %e, "connect failed");
                *self.shared.state.lock() = ConnectorState::Disconnected;
                return false;
            }
            warn!(endpoint = %self.endpoint(), error = %e, "connect failed, will retry");
        }

        let run = self.clone();
        let handle = std::thread::Builder::new()
            .name("connector-read".to_owned())
            .spawn(move || run.run_loop());

        match handle {
            Ok(handle) => {
                *self.shared.thread.lock() = Some(handle);
                true
            }
            Err(e) => {
                error!(error = %e, "cannot start read thread");
                self.shared.transport.disconnect();
                *self.shared.state.lock() = ConnectorState::Disconnected;
                false
            }
        }
    }

    /// Stop the read loop and close the transport. Idempotent; returns
    /// false when the connector was not active.
    pub fn deactivate(&self) -> bool {
        if self.state() == ConnectorState::Disconnected
            && self.shared.thread.lock().is_none()
        {
            return false;
        }

        self.shared.stop.store(true, Ordering::Release);
        self.shared.transport.disconnect();

        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                // Deactivated from a callback on the read thread itself; the
                // loop observes the stop flag and exits on its own.
                *self.shared.thread.lock() = handle.into();
            } else if let Err(e) = handle.join() {
                warn!("read thread panicked: {e:?}");
            }
        }

        *self.shared.state.lock() = ConnectorState::Disconnected;
        debug!(endpoint = %self.endpoint(), "deactivated");
        true
    }

    /// Write one frame, split into send-buffer sized chunks and flushed.
    /// Frames from concurrent callers never interleave.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let _guard = self.shared.write_lock.lock();

        let chunk_size = self.shared.transport.send_buffer_size().max(1);
        let outcome = data
            .chunks(chunk_size)
            .try_for_each(|chunk| self.shared.transport.write(chunk))
            .and_then(|_| self.shared.transport.flush());

        if let Err(e) = outcome {
            warn!(endpoint = %self.endpoint(), error = %e, "write failed");
            self.shared.transport.disconnect();
            return Err(e);
        }
        Ok(data.len())
    }

    /// Pull-mode read of the next frame, bypassing the listener machinery.
    /// With a sizer installed this returns one framed message; without one it
    /// returns whatever the transport produced. `None` falls back to the
    /// configured read timeout.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Bytes> {
        let timeout = timeout.unwrap_or_else(|| self.shared.config.lock().read_timeout);
        let deadline = Instant::now() + timeout;
        let factory = self.shared.sizer_factory.lock().clone();

        if factory.is_some() {
            let mut frames = self.shared.frames.lock();
            let buffer = frames
                .get_or_insert_with(|| FrameBuffer::new(factory.as_ref().unwrap()()));
            if let Some(frame) = buffer.pop() {
                return Ok(frame);
            }
        }

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => left,
                _ => return Err(WireError::Timeout(0)),
            };
            self.shared.transport.set_read_timeout(Some(remaining))?;

            match self.shared.transport.read(&mut chunk) {
                Ok(0) => return Err(WireError::NotConnected),
                Ok(n) => {
                    if factory.is_some() {
                        let mut frames = self.shared.frames.lock();
                        if let Some(buffer) = frames.as_mut() {
                            buffer.push(&chunk[..n]);
                            if let Some(frame) = buffer.pop() {
                                let _ = self.shared.transport.set_read_timeout(None);
                                return Ok(frame);
                            }
                        }
                    } else {
                        let _ = self.shared.transport.set_read_timeout(None);
                        return Ok(Bytes::copy_from_slice(&chunk[..n]));
                    }
                }
                Err(WireError::Io(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    let _ = self.shared.transport.set_read_timeout(None);
                    return Err(e);
                }
            }
        }
    }

    fn run_loop(self) {
        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }

            if !self.shared.transport.is_connected() {
                *self.shared.state.lock() = ConnectorState::Connecting;
                if let Err(e) = self.shared.transport.connect() {
                    if self.shared.stop.load(Ordering::Acquire)
                        || !self.shared.config.lock().reconnect
                    {
                        break;
                    }
                    debug!(endpoint = %self.endpoint(), error = %e, "reconnect attempt failed");
                    std::thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            }

            self.run_session();

            if self.shared.stop.load(Ordering::Acquire)
                || !self.shared.config.lock().reconnect
            {
                break;
            }
            std::thread::sleep(RECONNECT_DELAY);
        }

        *self.shared.state.lock() = ConnectorState::Disconnected;
    }

    /// One connected session: deliver frames until the connection ends.
    fn run_session(&self) {
        *self.shared.state.lock() = ConnectorState::Connected;
        self.shared.notified_closed.store(false, Ordering::Release);

        let write_timeout = self.shared.config.lock().write_timeout;
        let _ = self.shared.transport.set_write_timeout(Some(write_timeout));

        info!(endpoint = %self.endpoint(), "connected");

        let data_listener = self.shared.data_listener.lock().clone();
        if let Some(listener) = &data_listener {
            listener.session_started();
        }
        self.notify_established();

        let mut buffer = self
            .shared
            .sizer_factory
            .lock()
            .as_ref()
            .map(|factory| FrameBuffer::new(factory()));

        let mut chunk = vec![0u8; READ_CHUNK];
        let lost = loop {
            match self.shared.transport.read(&mut chunk) {
                Ok(0) => break !self.shared.stop.load(Ordering::Acquire),
                Ok(n) => {
                    let Some(listener) = &data_listener else {
                        continue;
                    };
                    match &mut buffer {
                        Some(buffer) => {
                            buffer.push(&chunk[..n]);
                            while let Some(frame) = buffer.pop() {
                                listener.data_received(self, frame);
                            }
                        }
                        None => {
                            listener.data_received(self, Bytes::copy_from_slice(&chunk[..n]));
                        }
                    }
                }
                Err(WireError::Io(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    if self.shared.stop.load(Ordering::Acquire) {
                        break false;
                    }
                    warn!(endpoint = %self.endpoint(), error = %e, "read failed");
                    break true;
                }
            }
        };

        self.shared.transport.disconnect();
        *self.shared.state.lock() = ConnectorState::Connecting;

        if let Some(listener) = &data_listener {
            listener.session_ended(lost);
        }
        self.notify_closed(lost);

        if lost {
            warn!(endpoint = %self.endpoint(), "connection lost");
        }
    }

    fn notify_established(&self) {
        let Some(listener) = self.shared.listener.lock().clone() else {
            return;
        };
        let connector = self.clone();
        self.shared.pool.spawn(move || {
            listener.connection_established(&connector);
        });
    }

    fn notify_closed(&self, lost: bool) {
        if self.shared.notified_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(listener) = self.shared.listener.lock().clone() else {
            return;
        };
        self.shared.pool.spawn(move || {
            listener.connection_closed(lost);
        });
    }
}
