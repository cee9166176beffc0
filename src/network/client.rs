//! Network Client
//!
//! Blocking RPC client for one-shot request/response exchanges with peers.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use super::protocol::{Request, Response};
use super::{read_response, write_message};
use crate::error::{Error, Result};

/// RPC client with a fixed retry budget
#[derive(Debug, Clone)]
pub struct RpcClient {
    /// Time allowed for one whole attempt, connect included
    timeout: Duration,
    /// Attempts per request
    max_retries: u32,
    /// Wait between attempts
    backoff: Duration,
    /// Largest response frame accepted
    max_frame_bytes: usize,
}

impl RpcClient {
    pub fn new(timeout: Duration, max_retries: u32, backoff: Duration, max_frame_bytes: usize) -> Self {
        Self {
            timeout,
            max_retries: max_retries.max(1),
            backoff,
            max_frame_bytes,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Send a request, retrying transport failures.
    ///
    /// Once the budget is spent this returns `PeerUnreachable` naming the
    /// address. Protocol failures are returned at once since the peer did
    /// answer.
    pub fn send(&self, address: &str, request: &Request) -> Result<Response> {
        for attempt in 1..=self.max_retries {
            match self.send_once(address, request) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        "{} to {} failed (attempt {}/{}): {}",
                        request.type_name(),
                        address,
                        attempt,
                        self.max_retries,
                        e
                    );
                    if attempt < self.max_retries {
                        thread::sleep(self.backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::PeerUnreachable {
            peer: address.to_string(),
            attempts: self.max_retries,
        })
    }

    /// One attempt: connect, write the request, read the response, close.
    ///
    /// The whole exchange shares a single deadline, so a peer trickling
    /// bytes cannot stretch an attempt past the timeout.
    pub fn send_once(&self, address: &str, request: &Request) -> Result<Response> {
        let deadline = Instant::now() + self.timeout;
        let stream = self.connect(address)?;
        let mut timed = DeadlineStream {
            stream: &stream,
            deadline,
        };

        let result = write_message(&mut timed, request)
            .and_then(|_| read_response(&mut timed, self.max_frame_bytes))
            .map_err(|e| timeout_error(address, e));

        let _ = stream.shutdown(Shutdown::Both);
        result
    }

    /// Connect to an address
    fn connect(&self, address: &str) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(|e| Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) if is_timeout(&e) => Error::ConnectionTimeout(address.to_string()),
            Some(e) => Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            },
            None => Error::ConnectionFailed {
                address: address.to_string(),
                reason: "address resolved to nothing".to_string(),
            },
        })
    }
}

/// Stream wrapper that shrinks socket timeouts toward a fixed deadline
struct DeadlineStream<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
}

impl DeadlineStream<'_> {
    fn remaining(&self) -> io::Result<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::Error::new(ErrorKind::TimedOut, "attempt deadline passed"));
        }
        Ok(left)
    }
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_read_timeout(Some(self.remaining()?))?;
        let mut stream = self.stream;
        stream.read(buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.set_write_timeout(Some(self.remaining()?))?;
        let mut stream = self.stream;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.stream;
        stream.flush()
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

fn timeout_error(address: &str, e: Error) -> Error {
    match e {
        Error::Io(io) if is_timeout(&io) => Error::ConnectionTimeout(address.to_string()),
        other => other,
    }
}
