//! End-to-end RPC over a TCP loopback: a real server with bound methods, a
//! real client peer, typed packets both ways.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;
use wirepeer::{
    wire_packet, ClientAcceptedListener, Connector, ConnectorServer, DispatchMode, MethodBinder,
    RpcPeer, TcpTransport, WireError, WorkerPool,
};

wire_packet! {
    pub struct AddRequest {
        pub a: i64,
        pub b: i64,
    }
}

wire_packet! {
    pub struct AddResponse {
        pub sum: i64,
    }
}

wire_packet! {
    pub struct FailRequest {
        pub reason: String,
    }
}

wire_packet! {
    pub struct SlowRequest {
        pub delay_ms: i64,
    }
}

wire_packet! {
    pub struct LogEvent {
        pub line: String,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Server fixture: accepts peers and serves the test methods.
struct Server {
    server: ConnectorServer,
    addr: String,
    pool: Arc<WorkerPool>,
    acceptor: Arc<Acceptor>,
    events: mpsc::Receiver<String>,
}

impl Server {
    /// Drop every accepted connection, as if the server process died.
    fn close_clients(&self) {
        for peer in self.acceptor.peers.lock().drain(..) {
            peer.deactivate();
        }
    }
}

struct Acceptor {
    binder: Arc<MethodBinder>,
    pool: Arc<WorkerPool>,
    peers: Mutex<Vec<RpcPeer>>,
}

impl ClientAcceptedListener for Acceptor {
    fn client_connected(&self, connector: Connector) {
        let peer = RpcPeer::new(connector, Arc::clone(&self.binder), Arc::clone(&self.pool));
        peer.activate(false);
        self.peers.lock().push(peer);
    }
}

fn start_server(mode: DispatchMode) -> Server {
    let pool = Arc::new(WorkerPool::with_defaults());
    let binder = Arc::new(MethodBinder::new(mode, Arc::clone(&pool)));

    binder.answer::<AddRequest, AddResponse, _>(|req| Ok(AddResponse { sum: req.a + req.b }));
    binder.answer::<FailRequest, AddResponse, _>(|req| {
        Err(WireError::Protocol(format!("refused: {}", req.reason)))
    });
    binder.answer::<SlowRequest, AddResponse, _>(|req| {
        std::thread::sleep(Duration::from_millis(req.delay_ms as u64));
        Ok(AddResponse { sum: req.delay_ms })
    });

    let (tx, events) = mpsc::channel();
    let tx = Mutex::new(tx);
    binder.on::<LogEvent, _>(move |event| {
        let _ = tx.lock().send(event.line);
    });

    let acceptor = Arc::new(Acceptor {
        binder,
        pool: Arc::clone(&pool),
        peers: Mutex::new(Vec::new()),
    });
    let server = ConnectorServer::bind_tcp(
        "127.0.0.1:0",
        Arc::clone(&pool),
        Arc::clone(&acceptor) as Arc<dyn ClientAcceptedListener>,
    )
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();

    Server {
        server,
        addr,
        pool,
        acceptor,
        events,
    }
}

fn connect_client(server: &Server) -> (RpcPeer, Arc<WorkerPool>) {
    let pool = Arc::new(WorkerPool::with_defaults());
    let binder = Arc::new(MethodBinder::new(DispatchMode::Concurrent, Arc::clone(&pool)));
    let connector = Connector::new(
        Box::new(TcpTransport::new(server.addr.clone())),
        Arc::clone(&pool),
    );
    let peer = RpcPeer::new(connector, binder, Arc::clone(&pool));
    assert!(peer.activate(false));
    (peer, pool)
}

#[test]
fn test_request_reply_roundtrip() {
    init_tracing();
    let server = start_server(DispatchMode::Concurrent);
    let (peer, pool) = connect_client(&server);

    let response: AddResponse = peer
        .send(&AddRequest { a: 2, b: 40 }, Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(response.sum, 42);

    // Same session, cached descriptors on both directions.
    let response: AddResponse = peer
        .send(&AddRequest { a: -5, b: 5 }, Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(response.sum, 0);

    peer.deactivate();
    server.server.stop();
    pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn test_handler_error_surfaces_as_remote_error() {
    init_tracing();
    let server = start_server(DispatchMode::Concurrent);
    let (peer, pool) = connect_client(&server);

    let result: Result<AddResponse, _> = peer.send(
        &FailRequest {
            reason: "bad day".into(),
        },
        Some(Duration::from_secs(5)),
    );

    match result {
        Err(WireError::Remote(message)) => assert!(message.contains("bad day")),
        other => panic!("expected remote error, got {other:?}"),
    }

    // The session survives a failed call.
    let response: AddResponse = peer
        .send(&AddRequest { a: 1, b: 1 }, Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(response.sum, 2);

    peer.deactivate();
    server.server.stop();
    pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn test_concurrent_sends_each_get_their_response() {
    init_tracing();
    let server = start_server(DispatchMode::Concurrent);
    let (peer, pool) = connect_client(&server);

    let mut workers = Vec::new();
    for i in 0..8i64 {
        let peer = peer.clone();
        workers.push(std::thread::spawn(move || {
            let response: AddResponse = peer
                .send(&AddRequest { a: i, b: i * 100 }, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(response.sum, i + i * 100);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    peer.deactivate();
    server.server.stop();
    pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn test_slow_handler_times_out_then_session_recovers() {
    init_tracing();
    let server = start_server(DispatchMode::Concurrent);
    let (peer, pool) = connect_client(&server);

    let result: Result<AddResponse, _> = peer.send(
        &SlowRequest { delay_ms: 400 },
        Some(Duration::from_millis(50)),
    );
    assert!(matches!(result, Err(WireError::Timeout(_))));

    // The late response arrives, finds no pending call, and is dropped;
    // later calls on the same session still work.
    std::thread::sleep(Duration::from_millis(500));
    let response: AddResponse = peer
        .send(&AddRequest { a: 3, b: 4 }, Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(response.sum, 7);

    peer.deactivate();
    server.server.stop();
    pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn test_notifications_reach_bound_handler() {
    init_tracing();
    let server = start_server(DispatchMode::Serial);
    let (peer, pool) = connect_client(&server);

    for i in 0..3 {
        assert!(peer.post(&LogEvent {
            line: format!("entry {i}"),
        }));
    }

    // Serial dispatch keeps notification order.
    let timeout = Duration::from_secs(2);
    assert_eq!(server.events.recv_timeout(timeout).unwrap(), "entry 0");
    assert_eq!(server.events.recv_timeout(timeout).unwrap(), "entry 1");
    assert_eq!(server.events.recv_timeout(timeout).unwrap(), "entry 2");

    peer.deactivate();
    server.server.stop();
    pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn test_server_gone_fails_pending_call() {
    init_tracing();
    let server = start_server(DispatchMode::Concurrent);
    let (peer, pool) = connect_client(&server);

    let disconnected = Arc::new(AtomicBool::new(false));
    struct Flag(Arc<AtomicBool>);
    impl wirepeer::PeerListener for Flag {
        fn peer_disconnected(&self, lost: bool) {
            if lost {
                self.0.store(true, Ordering::SeqCst);
            }
        }
    }
    peer.set_listener(Arc::new(Flag(Arc::clone(&disconnected))));

    // Ask for a slow reply, then kill the server side mid-call.
    let slow_peer = peer.clone();
    let call = std::thread::spawn(move || {
        slow_peer.send::<AddResponse>(&SlowRequest { delay_ms: 2000 }, Some(Duration::from_secs(10)))
    });

    std::thread::sleep(Duration::from_millis(100));
    server.close_clients();

    let result = call.join().unwrap();
    assert!(result.is_err());

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while !disconnected.load(Ordering::SeqCst) {
        assert!(std::time::Instant::now() < deadline, "no disconnect event");
        std::thread::sleep(Duration::from_millis(20));
    }

    peer.deactivate();
    server.server.stop();
    pool.shutdown();
    server.pool.shutdown();
}
