//! Listening side: accepts connections and wraps each one in a
//! [`Connector`].

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::transport::{TcpTransport, Transport};

/// Receives each accepted connection. The connector is not yet active;
/// attach listeners (or an [`RpcPeer`](crate::peer::RpcPeer)) and activate
/// it.
pub trait ClientAcceptedListener: Send + Sync {
    fn client_connected(&self, connector: Connector);
}

struct ServerInner {
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Wakes the blocked accept call by connecting to ourselves.
    wake: Box<dyn Fn() + Send + Sync>,
    /// Socket file to remove on stop (Unix variant).
    #[cfg(unix)]
    cleanup: Option<std::path::PathBuf>,
}

/// Accept loop on a dedicated thread. Accepted connectors never reconnect;
/// a dropped client is simply gone.
pub struct ConnectorServer {
    inner: Arc<ServerInner>,
    local_addr: Option<SocketAddr>,
}

impl ConnectorServer {
    pub fn bind_tcp(
        addr: &str,
        pool: Arc<WorkerPool>,
        listener: Arc<dyn ClientAcceptedListener>,
    ) -> Result<Self> {
        let socket = TcpListener::bind(addr)?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "listening");

        let inner = Arc::new(ServerInner {
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            wake: Box::new(move || {
                let _ = TcpStream::connect(local_addr);
            }),
            #[cfg(unix)]
            cleanup: None,
        });

        let run = Arc::clone(&inner);
        let accept_pool = Arc::clone(&pool);
        let handle = std::thread::Builder::new()
            .name("server-accept".to_owned())
            .spawn(move || {
                for stream in socket.incoming() {
                    if run.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let transport = match TcpTransport::from_stream(stream) {
                        Ok(transport) => transport,
                        Err(e) => {
                            warn!(error = %e, "cannot wrap accepted stream");
                            continue;
                        }
                    };

                    debug!(endpoint = %transport.endpoint(), "client accepted");
                    let connector = Connector::new(Box::new(transport), Arc::clone(&accept_pool));
                    let accepted = Arc::clone(&listener);
                    accept_pool.spawn(move || accepted.client_connected(connector));
                }
            })?;

        *inner.thread.lock() = Some(handle);
        Ok(Self {
            inner,
            local_addr: Some(local_addr),
        })
    }

    #[cfg(unix)]
    pub fn bind_pipe(
        path: &std::path::Path,
        pool: Arc<WorkerPool>,
        listener: Arc<dyn ClientAcceptedListener>,
    ) -> Result<Self> {
        use crate::transport::PipeTransport;
        use std::os::unix::net::{UnixListener, UnixStream};

        let _ = std::fs::remove_file(path);
        let socket = UnixListener::bind(path)?;
        info!(path = %path.display(), "listening");

        let wake_path = path.to_path_buf();
        let inner = Arc::new(ServerInner {
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            wake: Box::new(move || {
                let _ = UnixStream::connect(&wake_path);
            }),
            cleanup: Some(path.to_path_buf()),
        });

        let run = Arc::clone(&inner);
        let accept_pool = Arc::clone(&pool);
        let accept_path = path.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("server-accept".to_owned())
            .spawn(move || {
                for stream in socket.incoming() {
                    if run.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let transport = PipeTransport::from_stream(stream, &accept_path);
                    let connector = Connector::new(Box::new(transport), Arc::clone(&accept_pool));
                    let accepted = Arc::clone(&listener);
                    accept_pool.spawn(move || accepted.client_connected(connector));
                }
            })?;

        *inner.thread.lock() = Some(handle);
        Ok(Self {
            inner,
            local_addr: None,
        })
    }

    /// Bound address (TCP variant); useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting and join the accept thread. Idempotent. Existing
    /// connections stay up.
    pub fn stop(&self) {
        if self.inner.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        (self.inner.wake)();

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        #[cfg(unix)]
        if let Some(path) = &self.inner.cleanup {
            let _ = std::fs::remove_file(path);
        }
        debug!("server stopped");
    }
}

impl Drop for ConnectorServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Accepted(mpsc::Sender<Connector>);

    impl ClientAcceptedListener for Accepted {
        fn client_connected(&self, connector: Connector) {
            let _ = self.0.send(connector);
        }
    }

    #[test]
    fn test_accepts_clients_until_stopped() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let (tx, rx) = mpsc::channel();
        let server =
            ConnectorServer::bind_tcp("127.0.0.1:0", Arc::clone(&pool), Arc::new(Accepted(tx)))
                .unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let _c1 = TcpStream::connect(&addr).unwrap();
        let _c2 = TcpStream::connect(&addr).unwrap();

        let timeout = std::time::Duration::from_secs(2);
        let first = rx.recv_timeout(timeout).unwrap();
        let second = rx.recv_timeout(timeout).unwrap();
        assert_ne!(first.endpoint(), "");
        assert_ne!(second.endpoint(), "");

        server.stop();
        server.stop();
        pool.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_server_cleans_up_socket() {
        let path = std::env::temp_dir().join(format!("wirepeer-srv-{}.sock", std::process::id()));
        let pool = Arc::new(WorkerPool::with_defaults());
        let (tx, rx) = mpsc::channel();
        let server =
            ConnectorServer::bind_pipe(&path, Arc::clone(&pool), Arc::new(Accepted(tx))).unwrap();

        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();

        server.stop();
        assert!(!path.exists());
        pool.shutdown();
    }
}
