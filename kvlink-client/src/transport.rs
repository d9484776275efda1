//! # Socket Transport
//!
//! Purpose: Move raw bytes between the client and the server over one TCP
//! socket, with every blocking step bounded by a timeout.
//!
//! ## Design Principles
//! 1. **Bounded Connect**: `TcpStream::connect_timeout` performs the
//!    non-blocking connect plus readiness wait; one deadline covers every
//!    resolved address.
//! 2. **Bounded Retry**: Transient errors and tiny writes/reads count towards
//!    a retry ceiling; crossing it is reported as `TIMEOUT`.
//! 3. **Fatal Means Closed**: A peer close or hard socket error drops the
//!    stream so the owner observes a closed transport.
//!
//! ## Result Contract
//!
//! - `send` returns the number of bytes written (always the full buffer).
//! - `receive(.., exact = true)` returns exactly `buf.len()`.
//! - `receive(.., exact = false)` returns bytes read, or `0` when the socket
//!   timeout elapsed without data.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use kvlink_common::{ErrorCode, KvError, KvResult};
use tracing::{debug, trace};

/// Consecutive zero-progress iterations tolerated before giving up.
pub const RETRY_LIMIT: u32 = 100;

/// Transfers of this many bytes or fewer count as "no real progress".
const SMALL_TRANSFER: usize = 8;

/// Smallest socket timeout accepted by the OS (zero means "block forever").
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

/// One TCP byte channel.
#[derive(Debug, Default)]
pub struct Transport {
    stream: Option<TcpStream>,
}

impl Transport {
    /// Creates a transport with no open socket.
    pub fn new() -> Self {
        Transport { stream: None }
    }

    /// Connects to `host:port`, waiting at most `timeout` across all
    /// resolved addresses.
    ///
    /// Any previously open socket is closed first.
    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> KvResult<()> {
        self.close();
        if timeout.is_zero() {
            return Err(KvError::new(ErrorCode::ParamErr, "connect timeout must be positive"));
        }

        let addrs = (host, port).to_socket_addrs().map_err(|err| {
            KvError::new(ErrorCode::NetErr, format!("cannot resolve {}:{}: {}", host, port, err))
        })?;

        let stream = connect_within(addrs, timeout, |addr, budget| {
            TcpStream::connect_timeout(addr, budget)
        })
        .map_err(|err| {
            KvError::new(
                ErrorCode::NetErr,
                format!("connect to {}:{} failed: {}", host, port, err),
            )
        })?;

        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true).map_err(net_err)?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Sets the socket-level send timeout.
    pub fn set_send_timeout(&self, timeout: Duration) -> KvResult<()> {
        let stream = self.stream()?;
        stream
            .set_write_timeout(Some(timeout.max(MIN_SOCKET_TIMEOUT)))
            .map_err(net_err)
    }

    /// Sets the socket-level receive timeout.
    pub fn set_recv_timeout(&self, timeout: Duration) -> KvResult<()> {
        let stream = self.stream()?;
        stream
            .set_read_timeout(Some(timeout.max(MIN_SOCKET_TIMEOUT)))
            .map_err(net_err)
    }

    /// Writes the whole buffer.
    pub fn send(&mut self, buf: &[u8]) -> KvResult<usize> {
        let result = match self.stream.as_mut() {
            Some(stream) => write_bounded(stream, buf),
            None => Err(closed_err()),
        };
        self.close_on_fatal(result)
    }

    /// Reads into `buf`, either filling it (`exact`) or taking what is there.
    pub fn receive(&mut self, buf: &mut [u8], exact: bool) -> KvResult<usize> {
        let result = match self.stream.as_mut() {
            Some(stream) if exact => read_exact_bounded(stream, buf),
            Some(stream) => read_available(stream, buf),
            None => Err(closed_err()),
        };
        self.close_on_fatal(result)
    }

    /// Shuts the socket down and forgets it.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Returns true when no socket is open.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Local address of the open socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.local_addr().ok())
    }

    fn stream(&self) -> KvResult<&TcpStream> {
        self.stream.as_ref().ok_or_else(closed_err)
    }

    fn close_on_fatal(&mut self, result: KvResult<usize>) -> KvResult<usize> {
        if let Err(err) = &result {
            if matches!(err.kind(), ErrorCode::NetErr | ErrorCode::NetClose) {
                debug!(error = %err, "closing transport after fatal error");
                self.close();
            }
        }
        result
    }
}

/// Tries each address in turn until one connects, sharing one deadline.
///
/// Each attempt gets only the time left before the deadline.
fn connect_within<A, T, F>(addrs: A, timeout: Duration, mut attempt: F) -> io::Result<T>
where
    A: IntoIterator<Item = SocketAddr>,
    F: FnMut(&SocketAddr, Duration) -> io::Result<T>,
{
    let deadline = Instant::now() + timeout;
    let mut last_err = None;
    for addr in addrs {
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "connect timed out")));
        }
        match attempt(&addr, budget) {
            Ok(conn) => {
                debug!(%addr, "transport connected");
                return Ok(conn);
            }
            Err(err) => {
                trace!(%addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved")))
}

/// Writes all of `buf`, tolerating up to `RETRY_LIMIT` stalled iterations.
fn write_bounded<W: Write>(writer: &mut W, buf: &[u8]) -> KvResult<usize> {
    let mut written = 0;
    let mut stalls = 0;

    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => return Err(KvError::new(ErrorCode::NetClose, "peer stopped accepting data")),
            Ok(n) => {
                if n > SMALL_TRANSFER {
                    stalls = 0;
                } else {
                    stalls = bump(stalls)?;
                }
                written += n;
            }
            Err(err) if is_transient(&err) => stalls = bump(stalls)?,
            Err(err) => return Err(net_err(err)),
        }
    }

    Ok(written)
}

/// Reads exactly `buf.len()` bytes, tolerating up to `RETRY_LIMIT` stalls.
fn read_exact_bounded<R: Read>(reader: &mut R, buf: &mut [u8]) -> KvResult<usize> {
    let mut filled = 0;
    let mut stalls = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(KvError::from_code(ErrorCode::NetClose)),
            Ok(n) => {
                if n > SMALL_TRANSFER {
                    stalls = 0;
                } else {
                    stalls = bump(stalls)?;
                }
                filled += n;
            }
            Err(err) if is_transient(&err) => stalls = bump(stalls)?,
            Err(err) => return Err(net_err(err)),
        }
    }

    Ok(filled)
}

/// One best-effort read; `Ok(0)` means the socket timeout elapsed.
fn read_available<R: Read>(reader: &mut R, buf: &mut [u8]) -> KvResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    match reader.read(buf) {
        Ok(0) => Err(KvError::from_code(ErrorCode::NetClose)),
        Ok(n) => Ok(n),
        Err(err) if is_transient(&err) => Ok(0),
        Err(err) => Err(net_err(err)),
    }
}

fn bump(stalls: u32) -> KvResult<u32> {
    let stalls = stalls + 1;
    if stalls > RETRY_LIMIT {
        return Err(KvError::from_code(ErrorCode::Timeout));
    }
    Ok(stalls)
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn net_err(err: io::Error) -> KvError {
    KvError::new(ErrorCode::NetErr, err.to_string())
}

fn closed_err() -> KvError {
    KvError::new(ErrorCode::NetClose, "socket is closed")
}
