//! Request/response RPC on top of a [`Connector`].
//!
//! An [`RpcPeer`] frames typed packets into header-prefixed messages,
//! correlates responses to blocked callers by sequence number, and routes
//! inbound requests to a [`MethodBinder`]. Both sides of a connection run
//! the same peer type; who is "client" only depends on who calls
//! [`RpcPeer::send`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::binder::{DispatchContext, MethodBinder, ResponseSink};
use crate::codec::{wire_hash, Decoder, Encoder, FromValue, Packet, ToValue, TypeTable, Value};
use crate::connector::{Connector, ConnectorListener, DataListener};
use crate::error::{Result, WireError};
use crate::pool::WorkerPool;
use crate::protocol::message::{
    encode_message, flags, peer_sizer, MessageHeader, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};
use crate::protocol::framing::SizeHint;

/// Application-level connection events, delivered on pool workers.
pub trait PeerListener: Send + Sync {
    fn peer_connected(&self, _peer: &RpcPeer) {}
    fn peer_disconnected(&self, _lost: bool) {}
}

/// A caller blocked in [`RpcPeer::send`], waiting for its response.
struct PendingCall {
    result: Mutex<Option<Result<Value>>>,
    signal: Condvar,
}

impl PendingCall {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<Value>) {
        *self.result.lock() = Some(result);
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<Result<Value>> {
        let mut guard = self.result.lock();
        while guard.is_none() {
            if self.signal.wait_for(&mut guard, timeout).timed_out() {
                return guard.take();
            }
        }
        guard.take()
    }
}

struct PeerInner {
    me: Weak<PeerInner>,
    connector: Connector,
    binder: Arc<MethodBinder>,
    pool: Arc<WorkerPool>,
    protocol_id: AtomicI32,
    protocol_version: AtomicI32,
    sequence: AtomicI32,
    pending: Mutex<HashMap<i32, Arc<PendingCall>>>,
    /// Session-scoped descriptor caches, one per direction.
    encode_table: Mutex<TypeTable>,
    decode_table: Mutex<TypeTable>,
    listener: Mutex<Option<Arc<dyn PeerListener>>>,
}

/// Shared RPC endpoint handle; clones refer to the same peer.
#[derive(Clone)]
pub struct RpcPeer {
    inner: Arc<PeerInner>,
}

impl RpcPeer {
    pub fn new(connector: Connector, binder: Arc<MethodBinder>, pool: Arc<WorkerPool>) -> Self {
        let inner = Arc::new_cyclic(|me| PeerInner {
            me: me.clone(),
            connector,
            binder,
            pool,
            protocol_id: AtomicI32::new(0),
            protocol_version: AtomicI32::new(1),
            sequence: AtomicI32::new(0),
            pending: Mutex::new(HashMap::new()),
            encode_table: Mutex::new(TypeTable::new()),
            decode_table: Mutex::new(TypeTable::new()),
            listener: Mutex::new(None),
        });
        Self { inner }
    }

    /// Discriminator and version stamped into every outgoing header;
    /// inbound messages with a different discriminator are dropped.
    pub fn set_protocol(&self, id: i16, version: i16) {
        self.inner.protocol_id.store(id as i32, Ordering::Relaxed);
        self.inner
            .protocol_version
            .store(version as i32, Ordering::Relaxed);
    }

    pub fn set_listener(&self, listener: Arc<dyn PeerListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    pub fn binder(&self) -> &MethodBinder {
        &self.inner.binder
    }

    /// Install the message framing and start the connector.
    pub fn activate(&self, reconnect: bool) -> bool {
        let inner = Arc::clone(&self.inner);
        self.inner.connector.set_reconnect(reconnect);
        self.inner
            .connector
            .set_sizer(|| Box::new(peer_sizer(DEFAULT_MAX_FRAME_SIZE)) as Box<dyn FnMut(&[u8]) -> SizeHint + Send>);
        self.inner
            .connector
            .set_data_listener(Arc::clone(&inner) as Arc<dyn DataListener>);
        self.inner
            .connector
            .set_listener(inner as Arc<dyn ConnectorListener>);
        self.inner.connector.activate()
    }

    /// Fail every pending call and stop the connector.
    pub fn deactivate(&self) -> bool {
        self.inner.fail_pending();
        self.inner.connector.deactivate()
    }

    pub fn is_active(&self) -> bool {
        self.inner.connector.is_active()
    }

    /// Fire-and-forget notification; no response is expected or routed.
    pub fn post(&self, packet: &impl Packet) -> bool {
        match self.inner.write_message(
            wire_hash_of(packet),
            0,
            0,
            &packet.to_value(),
        ) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "post failed");
                false
            }
        }
    }

    /// Send a request and block until the typed response arrives. `None`
    /// falls back to the connector read timeout.
    pub fn send<R: Packet>(&self, packet: &impl Packet, timeout: Option<Duration>) -> Result<R> {
        let message_id = wire_hash_of(packet);
        let sequence = self.inner.next_sequence();
        let timeout = timeout.unwrap_or_else(|| self.inner.connector.read_timeout());

        let call = Arc::new(PendingCall::new());
        self.inner
            .pending
            .lock()
            .insert(sequence, Arc::clone(&call));

        if let Err(e) = self
            .inner
            .write_message(message_id, sequence, 0, &packet.to_value())
        {
            self.inner.pending.lock().remove(&sequence);
            return Err(e);
        }

        let outcome = call.wait(timeout);
        self.inner.pending.lock().remove(&sequence);

        match outcome {
            Some(Ok(value)) => R::from_value(&value).ok_or_else(|| {
                WireError::Decode(format!("response is not a {}", R::TYPE_NAME))
            }),
            Some(Err(e)) => Err(e),
            None => {
                let method = self
                    .inner
                    .binder
                    .method_name(message_id)
                    .unwrap_or("<unbound>");
                warn!(message_id, method, sequence, ?timeout, "call timed out");
                Err(WireError::Timeout(message_id))
            }
        }
    }
}

fn wire_hash_of<T: Packet>(_packet: &T) -> i32 {
    T::message_id()
}

impl PeerInner {
    fn peer(&self) -> Option<RpcPeer> {
        self.me.upgrade().map(|inner| RpcPeer { inner })
    }

    /// Next request sequence; wraps back to 1, never 0 (0 marks a
    /// notification).
    fn next_sequence(&self) -> i32 {
        let previous = self
            .sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if current >= i32::MAX - 1 { 1 } else { current + 1 })
            })
            .unwrap_or(0);
        if previous >= i32::MAX - 1 {
            1
        } else {
            previous + 1
        }
    }

    fn write_message(
        &self,
        message_id: i32,
        sequence: i32,
        message_flags: i16,
        value: &Value,
    ) -> Result<()> {
        let payload = {
            let mut table = self.encode_table.lock();
            Encoder::new(&mut table).encode(value)?
        };

        let header = MessageHeader::new(
            self.protocol_id.load(Ordering::Relaxed) as i16,
            self.protocol_version.load(Ordering::Relaxed) as i16,
            message_id,
            sequence,
            message_flags,
        );
        let message = encode_message(&header, &payload);
        self.connector.write(&message)?;
        Ok(())
    }

    fn fail_pending(&self) {
        let calls: Vec<Arc<PendingCall>> = self.pending.lock().drain().map(|(_, c)| c).collect();
        for call in calls {
            call.complete(Err(WireError::NotConnected));
        }
    }

    fn handle_response(&self, header: &MessageHeader, payload: &[u8]) {
        let call = self.pending.lock().remove(&header.sequence);
        let Some(call) = call else {
            warn!(
                sequence = header.sequence,
                message_id = header.message_id,
                "late response dropped"
            );
            return;
        };

        let decoded = {
            let mut table = self.decode_table.lock();
            Decoder::new(&mut table, payload).decode()
        };

        let result = match decoded {
            Ok(value) if header.is_error() => {
                let message = match value {
                    Value::String(s) => s,
                    other => format!("{other:?}"),
                };
                Err(WireError::Remote(message))
            }
            Ok(value) => Ok(value),
            Err(e) => Err(e),
        };

        call.complete(result);
    }

    fn handle_request(&self, header: &MessageHeader, payload: &[u8]) {
        let decoded = {
            let mut table = self.decode_table.lock();
            Decoder::new(&mut table, payload).decode()
        };

        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    message_id = header.message_id,
                    sequence = header.sequence,
                    error = %e,
                    "undecodable message dropped"
                );
                return;
            }
        };

        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.binder.dispatch(DispatchContext {
            message_id: header.message_id,
            sequence: header.sequence,
            value,
            sink: me as Arc<dyn ResponseSink>,
        });
    }
}

impl DataListener for PeerInner {
    fn session_started(&self) {
        // Fresh session, fresh descriptor id space on both directions.
        self.encode_table.lock().clear();
        self.decode_table.lock().clear();
        debug!("peer session started");
    }

    fn data_received(&self, _connector: &Connector, frame: Bytes) {
        let header = match MessageHeader::decode(&frame) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "bad frame dropped");
                return;
            }
        };

        let expected = self.protocol_id.load(Ordering::Relaxed) as i16;
        if header.protocol_id != expected {
            warn!(
                got = header.protocol_id,
                expected, "foreign protocol id, message dropped"
            );
            return;
        }

        let payload = &frame[HEADER_SIZE..];
        if header.is_response() {
            self.handle_response(&header, payload);
        } else {
            self.handle_request(&header, payload);
        }
    }

    fn session_ended(&self, _lost: bool) {
        self.fail_pending();
    }
}

impl ConnectorListener for PeerInner {
    fn connection_established(&self, _connector: &Connector) {
        let listener = self.listener.lock().clone();
        if let (Some(listener), Some(peer)) = (listener, self.peer()) {
            listener.peer_connected(&peer);
        }
    }

    fn connection_closed(&self, lost: bool) {
        if let Some(listener) = self.listener.lock().clone() {
            listener.peer_disconnected(lost);
        }
    }
}

impl ResponseSink for PeerInner {
    fn send_reply(&self, request_id: i32, sequence: i32, value: &Value) {
        // Responses are identified by the reply type where there is one,
        // falling back to the request id for bare values.
        let message_id = match value {
            Value::Object(obj) => wire_hash(obj.type_name()),
            _ => request_id,
        };
        if let Err(e) = self.write_message(message_id, sequence, flags::IS_RESPONSE, value) {
            warn!(sequence, error = %e, "cannot send reply");
        }
    }

    fn send_error(&self, request_id: i32, sequence: i32, message: &str) {
        let value = Value::String(message.to_owned());
        if let Err(e) = self.write_message(
            request_id,
            sequence,
            flags::IS_RESPONSE | flags::IS_ERROR,
            &value,
        ) {
            warn!(sequence, error = %e, "cannot send error reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wraps_past_max_skipping_zero() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let binder = Arc::new(MethodBinder::new(
            crate::binder::DispatchMode::Concurrent,
            Arc::clone(&pool),
        ));
        let connector = Connector::new(
            Box::new(crate::transport::TcpTransport::new("127.0.0.1:1")),
            Arc::clone(&pool),
        );
        let peer = RpcPeer::new(connector, binder, Arc::clone(&pool));

        assert_eq!(peer.inner.next_sequence(), 1);
        assert_eq!(peer.inner.next_sequence(), 2);

        peer.inner.sequence.store(i32::MAX - 1, Ordering::Relaxed);
        assert_eq!(peer.inner.next_sequence(), 1);
        assert_eq!(peer.inner.next_sequence(), 2);
        pool.shutdown();
    }

    #[test]
    fn test_pending_call_times_out_and_completes() {
        let call = Arc::new(PendingCall::new());
        assert!(call.wait(Duration::from_millis(30)).is_none());

        let waiter = Arc::clone(&call);
        let thread = std::thread::spawn(move || waiter.wait(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(20));
        call.complete(Ok(Value::Int(5)));

        let outcome = thread.join().unwrap();
        assert!(matches!(outcome, Some(Ok(Value::Int(5)))));
    }

    #[test]
    fn test_deactivate_releases_pending() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let binder = Arc::new(MethodBinder::new(
            crate::binder::DispatchMode::Concurrent,
            Arc::clone(&pool),
        ));
        let connector = Connector::new(
            Box::new(crate::transport::TcpTransport::new("127.0.0.1:1")),
            Arc::clone(&pool),
        );
        let peer = RpcPeer::new(connector, binder, Arc::clone(&pool));

        let call = Arc::new(PendingCall::new());
        peer.inner.pending.lock().insert(9, Arc::clone(&call));
        peer.deactivate();

        let outcome = call.wait(Duration::from_millis(100));
        assert!(matches!(outcome, Some(Err(WireError::NotConnected))));
        pool.shutdown();
    }
}
