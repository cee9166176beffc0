//! Network Server
//!
//! TCP server accepting one-shot requests from other nodes. Each accepted
//! connection is served on its own thread.

use std::collections::HashMap;
use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::protocol::{decode_request, Request, Response};
use super::{read_frame, write_message};
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

/// Request handler callback type
pub type RequestHandler = Arc<dyn Fn(Request) -> Response + Send + Sync>;

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(50);

type ConnectionRegistry = Arc<Mutex<HashMap<u64, TcpStream>>>;

/// Network server for node-to-node requests
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Largest request frame accepted
    max_frame_bytes: usize,
    /// Read and write timeout on accepted connections
    io_timeout: Duration,
    /// Shutdown signal
    shutdown: Shutdown,
    /// Open inbound connections, closed on stop
    connections: ConnectionRegistry,
    next_connection: Arc<AtomicU64>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl NetworkServer {
    pub fn new(bind_address: impl Into<String>, max_frame_bytes: usize, io_timeout: Duration) -> Self {
        Self {
            bind_address: bind_address.into(),
            max_frame_bytes,
            io_timeout,
            shutdown: Shutdown::new(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection: Arc::new(AtomicU64::new(0)),
            accept_thread: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind and start accepting. A bind failure is returned to the caller.
    pub fn start(&self, handler: RequestHandler) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.bind_address).map_err(|e| {
            Error::Network(format!("failed to bind {}: {}", self.bind_address, e))
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Network server listening on {}", local_addr);

        let shutdown = self.shutdown.clone();
        let connections = Arc::clone(&self.connections);
        let next_connection = Arc::clone(&self.next_connection);
        let max_frame_bytes = self.max_frame_bytes;
        let io_timeout = self.io_timeout;

        let handle = thread::Builder::new()
            .name("wolfsync-accept".into())
            .spawn(move || {
                while !shutdown.is_triggered() {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            let id = next_connection.fetch_add(1, Ordering::Relaxed);
                            if let Ok(clone) = stream.try_clone() {
                                lock(&connections).insert(id, clone);
                            }

                            let handler = Arc::clone(&handler);
                            let registry = Arc::clone(&connections);
                            let spawned = thread::Builder::new()
                                .name(format!("wolfsync-conn-{}", id))
                                .spawn(move || {
                                    if let Err(e) = handle_connection(
                                        stream,
                                        addr,
                                        &handler,
                                        max_frame_bytes,
                                        io_timeout,
                                    ) {
                                        tracing::debug!("Connection error from {}: {}", addr, e);
                                    }
                                    lock(&registry).remove(&id);
                                });
                            if let Err(e) = spawned {
                                tracing::error!("Failed to spawn connection thread: {}", e);
                                lock(&connections).remove(&id);
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            shutdown.wait_timeout(ACCEPT_POLL);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            shutdown.wait_timeout(ACCEPT_POLL);
                        }
                    }
                }
                tracing::info!("Network server stopped");
            })?;

        *lock(&self.accept_thread) = Some(handle);
        *lock(&self.local_addr) = Some(local_addr);
        Ok(local_addr)
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Number of inbound connections currently being served
    pub fn open_connections(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Stop accepting, close the listener and every open connection
    pub fn stop(&self) {
        self.shutdown.trigger();

        if let Some(handle) = lock(&self.accept_thread).take() {
            let _ = handle.join();
        }

        for (_, stream) in lock(&self.connections).drain() {
            let _ = stream.shutdown(SocketShutdown::Both);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serve a single request on an accepted connection
fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: &RequestHandler,
    max_frame_bytes: usize,
    io_timeout: Duration,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;

    let response = match read_frame(&mut stream, max_frame_bytes) {
        Ok(body) => match decode_request(&body) {
            Ok(request) => {
                tracing::trace!("Received {} from {}", request.type_name(), addr);
                handler(request)
            }
            Err(response) => {
                tracing::warn!(
                    "Rejected message from {}: {}",
                    addr,
                    response.error_message()
                );
                response
            }
        },
        Err(Error::FrameTooLarge(len)) => {
            tracing::warn!("Rejected {} byte frame from {}", len, addr);
            Response::error(format!("frame too large: {} bytes", len))
        }
        // Truncated or timed out: nothing to answer
        Err(e) => return Err(e),
    };

    write_message(&mut stream, &response)?;
    let _ = stream.shutdown(SocketShutdown::Both);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{read_response, write_frame, RpcClient};
    use std::io::Write;

    fn echo_server() -> (NetworkServer, SocketAddr) {
        let server = NetworkServer::new("127.0.0.1:0", 1024, Duration::from_secs(2));
        let handler: RequestHandler = Arc::new(|request: Request| {
            Response::error(format!("handled {}", request.type_name()))
        });
        let addr = server.start(handler).unwrap();
        (server, addr)
    }

    #[test]
    fn test_request_reaches_handler() {
        let (server, addr) = echo_server();
        let client = RpcClient::new(Duration::from_secs(2), 1, Duration::ZERO, 1024);

        let resp = client
            .send(
                &addr.to_string(),
                &Request::ListFiles {
                    source_node: "node-2".into(),
                },
            )
            .unwrap();
        assert_eq!(resp.message.as_deref(), Some("handled list_files"));
        server.stop();
    }

    #[test]
    fn test_invalid_json_gets_error_response() {
        let (server, addr) = echo_server();

        let mut stream = TcpStream::connect(addr).unwrap();
        write_frame(&mut stream, b"{not json").unwrap();
        let resp = read_response(&mut stream, 1024).unwrap();
        assert_eq!(resp.message.as_deref(), Some("invalid json"));

        let mut stream = TcpStream::connect(addr).unwrap();
        write_frame(&mut stream, br#"{"type":"bogus"}"#).unwrap();
        let resp = read_response(&mut stream, 1024).unwrap();
        assert_eq!(resp.message.as_deref(), Some("unknown type"));
        server.stop();
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (server, addr) = echo_server();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&[0, 0, 0x10, 0]).unwrap();
        let resp = read_response(&mut stream, 1024).unwrap();
        assert!(!resp.is_ok());
        assert!(resp.message.unwrap().contains("frame too large"));
        server.stop();
    }

    #[test]
    fn test_stop_releases_port_and_connections() {
        let (server, addr) = echo_server();

        // Half-open connection: never sends a frame
        let _idle = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(150));

        server.stop();
        assert_eq!(server.open_connections(), 0);

        let rebound = TcpListener::bind(addr);
        assert!(rebound.is_ok());
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let (server, addr) = echo_server();
        let second = NetworkServer::new(addr.to_string(), 1024, Duration::from_secs(1));
        let handler: RequestHandler = Arc::new(|_| Response::ok());
        assert!(second.start(handler).is_err());
        server.stop();
    }
}
