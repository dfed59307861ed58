//! Transport-agnostic binary RPC for long-lived device and service links.
//!
//! The stack, bottom to top:
//!
//! - [`transport`] — connected byte streams: TCP, UDP, Unix sockets, serial
//!   ports and WebSockets behind one [`Transport`](transport::Transport)
//!   trait.
//! - [`protocol`] — frame reassembly with a pluggable sizing function, and
//!   the fixed 18-byte message header.
//! - [`codec`] — a self-describing binary encoding: type descriptors are
//!   sent once per session, repeated object instances become
//!   back-references, and typed structs plug in via [`wire_packet!`].
//! - [`connector`] / [`server`] — connection lifecycle with optional
//!   reconnect, plus the accepting side.
//! - [`peer`] / [`binder`] — request/response correlation and typed method
//!   dispatch, serial or concurrent, on an elastic [`pool::WorkerPool`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wirepeer::{
//!     Connector, DispatchMode, MethodBinder, RpcPeer, TcpTransport, WorkerPool, wire_packet,
//! };
//!
//! wire_packet! {
//!     pub struct Ping { pub count: i32 }
//! }
//!
//! wire_packet! {
//!     pub struct Pong { pub count: i32 }
//! }
//!
//! # fn main() -> wirepeer::Result<()> {
//! let pool = Arc::new(WorkerPool::with_defaults());
//! let binder = Arc::new(MethodBinder::new(DispatchMode::Concurrent, Arc::clone(&pool)));
//! binder.answer::<Ping, Pong, _>(|ping| Ok(Pong { count: ping.count + 1 }));
//!
//! let connector = Connector::new(
//!     Box::new(TcpTransport::new("127.0.0.1:9000")),
//!     Arc::clone(&pool),
//! );
//! let peer = RpcPeer::new(connector, binder, pool);
//! peer.activate(true);
//!
//! let pong: Pong = peer.send(&Ping { count: 1 }, None)?;
//! assert_eq!(pong.count, 2);
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod codec;
pub mod connector;
pub mod error;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transport;

pub use binder::{DispatchContext, DispatchMode, MethodBinder, ResponseSink};
pub use codec::{FromValue, ObjectValue, Packet, ToValue, TypeTable, Unit, Value};
pub use connector::{Connector, ConnectorListener, ConnectorState, DataListener};
pub use error::{Result, WireError};
pub use peer::{PeerListener, RpcPeer};
pub use pool::WorkerPool;
pub use protocol::{FrameBuffer, MessageHeader, SizeHint, Sizer};
pub use server::{ClientAcceptedListener, ConnectorServer};
pub use transport::{SerialTransport, TcpTransport, Transport, UdpTransport, WsTransport};

#[cfg(unix)]
pub use transport::PipeTransport;
