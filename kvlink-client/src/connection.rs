//! # Connection
//!
//! Purpose: Own one server session (transport + receive buffer) and run
//! commands on it, remembering enough to reconnect later.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: Typed helpers (`get`, `lpush`, `eval`, ...) are thin
//!    builders over `execute`.
//! 2. **Two Timeouts**: A short socket timeout keeps each read responsive,
//!    the logical timeout bounds how long a reply may stall overall.
//! 3. **Last Outcome Visible**: `error_code`, `error_string` and `status`
//!    describe the last execution for presentation code.
//! 4. **Desync Means Closed**: After a failure that may leave reply bytes in
//!    flight (timeout, protocol error, oversized reply) the socket is closed.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──connect()──> open ──authenticate()──> ready
//!                        │                        │ fatal I/O / close()
//!                        └────────────────────────┴──> closed ──reconnect()──> ready
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use kvlink_common::{ErrorCode, KvError, KvResult};
use tracing::{debug, trace, warn};

use crate::command::{Command, Reply};
use crate::resp::RespDecoder;
use crate::transport::Transport;

/// Default logical timeout for one command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default receive buffer capacity (2 MiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 2 * 1024 * 1024;

/// Default socket-level send/receive timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(10);

/// Bytes pulled from the socket per read.
const READ_CHUNK: usize = 16 * 1024;

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Parameters replayed by `reconnect`.
#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    timeout: Duration,
    buffer_capacity: usize,
}

/// One client session with a Redis-compatible server.
#[derive(Debug)]
pub struct Connection {
    transport: Transport,
    decoder: Option<RespDecoder>,
    read_chunk: Vec<u8>,
    write_buf: Vec<u8>,
    endpoint: Option<Endpoint>,
    password: String,
    socket_timeout: Duration,
    code: i64,
    status: i64,
    message: String,
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl Connection {
    /// Creates a disconnected session.
    pub fn new() -> Self {
        Connection {
            transport: Transport::new(),
            decoder: None,
            read_chunk: Vec::new(),
            write_buf: Vec::with_capacity(256),
            endpoint: None,
            password: String::new(),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            code: 0,
            status: 0,
            message: String::new(),
        }
    }

    /// Overrides the socket-level timeout used by later `connect` calls.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Connects and authenticates in one step.
    pub fn open(
        host: &str,
        port: u16,
        password: &str,
        timeout: Duration,
        buffer_capacity: usize,
    ) -> KvResult<Self> {
        let mut conn = Connection::new();
        conn.connect(host, port, timeout, buffer_capacity)?;
        conn.authenticate(password)?;
        Ok(conn)
    }

    /// Opens a session to `host:port`, closing any previous one.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
        buffer_capacity: usize,
    ) -> KvResult<()> {
        self.close();
        if buffer_capacity == 0 {
            return Err(self.record(KvError::new(
                ErrorCode::ParamErr,
                "receive buffer capacity must be positive",
            )));
        }
        if let Err(err) = self.transport.connect(host, port, timeout) {
            return Err(self.record(err));
        }

        // The socket timeout only paces reads; it must stay below the logical one.
        let socket_timeout = self.socket_timeout.min(timeout);
        let configured = self
            .transport
            .set_send_timeout(socket_timeout)
            .and_then(|()| self.transport.set_recv_timeout(socket_timeout));
        if let Err(err) = configured {
            self.transport.close();
            return Err(self.record(err));
        }

        self.decoder = Some(RespDecoder::with_capacity(buffer_capacity));
        self.read_chunk = vec![0u8; READ_CHUNK.min(buffer_capacity)];
        self.endpoint = Some(Endpoint {
            host: host.to_string(),
            port,
            timeout,
            buffer_capacity,
        });
        self.code = 0;
        self.status = 0;
        self.message.clear();
        debug!(host, port, ?timeout, buffer_capacity, "connection established");
        Ok(())
    }

    /// Binds `password` to the session and issues `AUTH` when it is not empty.
    pub fn authenticate(&mut self, password: &str) -> KvResult<()> {
        self.password = password.to_string();
        if password.is_empty() {
            return Ok(());
        }

        match self.call(Command::new("AUTH").arg(password)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorCode::Fail => {
                warn!(host = ?self.host(), error = %err.message(), "authentication rejected");
                Err(self.record(KvError::new(ErrorCode::AuthFail, err.message())))
            }
            Err(err) => Err(err),
        }
    }

    /// Reopens the session with the last successful parameters.
    pub fn reconnect(&mut self) -> KvResult<()> {
        let Some(endpoint) = self.endpoint.clone() else {
            return Err(KvError::new(
                ErrorCode::ParamErr,
                "connection was never established",
            ));
        };
        debug!(host = %endpoint.host, port = endpoint.port, "reconnecting");
        let password = self.password.clone();
        self.connect(
            &endpoint.host,
            endpoint.port,
            endpoint.timeout,
            endpoint.buffer_capacity,
        )?;
        self.authenticate(&password)
    }

    /// Releases the socket and the receive buffer.
    pub fn close(&mut self) {
        if !self.transport.is_closed() {
            debug!(host = ?self.host(), "closing connection");
        }
        self.transport.close();
        self.decoder = None;
    }

    /// Returns true when the socket is closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Returns true when the session is open and its last failure, if any,
    /// left it in sync with the server.
    pub fn is_healthy(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match ErrorCode::from_code(self.error_code()) {
            Some(code) => !code.breaks_connection(),
            None => true,
        }
    }

    /// Host of the last successful connect.
    pub fn host(&self) -> Option<&str> {
        self.endpoint.as_ref().map(|endpoint| endpoint.host.as_str())
    }

    /// Port of the last successful connect.
    pub fn port(&self) -> Option<u16> {
        self.endpoint.as_ref().map(|endpoint| endpoint.port)
    }

    /// Logical timeout applied to each command.
    pub fn timeout(&self) -> Duration {
        self.endpoint
            .as_ref()
            .map_or(DEFAULT_TIMEOUT, |endpoint| endpoint.timeout)
    }

    /// Local socket address, when connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Numeric payload of the last reply (integer value, or 1 for `+OK`).
    #[inline]
    pub fn status(&self) -> i64 {
        self.status
    }

    /// Last error code, `0` after a success, always `FAIL` once closed.
    pub fn error_code(&self) -> i32 {
        if self.transport.is_closed() {
            return ErrorCode::Fail.code();
        }
        if self.code < 0 {
            self.code as i32
        } else {
            0
        }
    }

    /// Message of the last execution (server text or default error text).
    #[inline]
    pub fn error_string(&self) -> &str {
        &self.message
    }

    /// Sends `cmd` and waits for its reply.
    ///
    /// Returns `1` for status, integer and bulk replies, or the number of
    /// entries for array replies; the reply itself lands in `cmd.reply()`.
    pub fn execute(&mut self, cmd: &mut Command) -> KvResult<i64> {
        cmd.reply_mut().reset();
        self.status = 0;
        self.message.clear();

        match self.round_trip(cmd) {
            Ok(code) => {
                self.code = code;
                self.status = cmd.reply().status();
                self.message = cmd.reply().message().to_string();
                Ok(code)
            }
            Err(err) => {
                self.status = cmd.reply().status();
                if err.kind().breaks_connection() && !self.transport.is_closed() {
                    warn!(host = ?self.host(), error = %err, "dropping desynchronized connection");
                    self.transport.close();
                }
                Err(self.record(err))
            }
        }
    }

    fn round_trip(&mut self, cmd: &mut Command) -> KvResult<i64> {
        let timeout = self.timeout();
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(KvError::new(ErrorCode::NetClose, "connection is not open"));
        };
        decoder.clear();

        self.write_buf.clear();
        cmd.encode(&mut self.write_buf);
        self.transport.send(&self.write_buf)?;

        let mut last_progress = Instant::now();
        loop {
            let room = decoder.remaining_capacity().min(self.read_chunk.len());
            if room == 0 {
                return Err(KvError::new(
                    ErrorCode::ParamErr,
                    "reply exceeds receive buffer",
                ));
            }

            let read = self.transport.receive(&mut self.read_chunk[..room], false)?;
            if read == 0 {
                if last_progress.elapsed() > timeout {
                    return Err(KvError::from_code(ErrorCode::Timeout));
                }
                continue;
            }

            decoder.extend(&self.read_chunk[..read])?;
            last_progress = Instant::now();
            if let Some(value) = decoder.decode()? {
                trace!(bytes = read, "reply decoded");
                return cmd.reply_mut().absorb(value);
            }
        }
    }

    /// Runs a command built from plain arguments (name first).
    pub fn execute_args<I, A>(&mut self, args: I) -> KvResult<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.call(Command::from_args(args))
    }

    pub(crate) fn call(&mut self, mut cmd: Command) -> KvResult<Reply> {
        self.execute(&mut cmd)?;
        Ok(cmd.into_reply())
    }

    fn call_int(&mut self, cmd: Command) -> KvResult<i64> {
        self.call(cmd).map(|reply| reply.status())
    }

    fn call_value(&mut self, cmd: Command) -> KvResult<Option<Vec<u8>>> {
        match self.call(cmd) {
            Ok(mut reply) => Ok(reply.take_data().into_iter().next()),
            Err(err) if err.kind() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn call_list(&mut self, cmd: Command) -> KvResult<Vec<Vec<u8>>> {
        self.call(cmd).map(|mut reply| reply.take_data())
    }

    fn record(&mut self, err: KvError) -> KvError {
        self.code = err.code() as i64;
        self.message = err.message().to_string();
        err
    }
}

// Typed helpers. Integer commands return the server's integer; lookups map
// a null reply to `None`.
impl Connection {
    /// `PING`.
    pub fn ping(&mut self) -> KvResult<()> {
        self.call(Command::new("PING")).map(|_| ())
    }

    /// `DEL key`; returns the number of keys removed.
    pub fn del(&mut self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.call_int(Command::new("DEL").arg(key))
    }

    /// `EXISTS key`.
    pub fn exists(&mut self, key: impl AsRef<[u8]>) -> KvResult<bool> {
        self.call_int(Command::new("EXISTS").arg(key)).map(|n| n > 0)
    }

    /// `TTL key`.
    pub fn ttl(&mut self, key: impl AsRef<[u8]>) -> KvResult<KeyTtl> {
        match self.call_int(Command::new("TTL").arg(key))? {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::NoExpiry),
            secs if secs >= 0 => Ok(KeyTtl::ExpiresIn(Duration::from_secs(secs as u64))),
            other => Err(KvError::new(
                ErrorCode::DataErr,
                format!("unexpected TTL reply {}", other),
            )),
        }
    }

    /// `EXPIRE key seconds`; true when the timeout was set.
    pub fn expire(&mut self, key: impl AsRef<[u8]>, seconds: u64) -> KvResult<bool> {
        self.call_int(Command::new("EXPIRE").arg(key).arg_uint(seconds))
            .map(|n| n == 1)
    }

    /// `GET key`.
    pub fn get(&mut self, key: impl AsRef<[u8]>) -> KvResult<Option<Vec<u8>>> {
        self.call_value(Command::new("GET").arg(key))
    }

    /// `SET key value`.
    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> KvResult<()> {
        self.call(Command::new("SET").arg(key).arg(value)).map(|_| ())
    }

    /// `SETEX key seconds value`, or plain `SET` when `ttl` is under a second.
    pub fn set_with_ttl(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> KvResult<()> {
        let seconds = ttl.as_secs();
        let cmd = if seconds > 0 {
            Command::new("SETEX").arg(key).arg_uint(seconds).arg(value)
        } else {
            Command::new("SET").arg(key).arg(value)
        };
        self.call(cmd).map(|_| ())
    }

    /// `INCRBY key 1`.
    pub fn incr(&mut self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.incr_by(key, 1)
    }

    /// `INCRBY key delta`; returns the new value.
    pub fn incr_by(&mut self, key: impl AsRef<[u8]>, delta: i64) -> KvResult<i64> {
        self.call_int(Command::new("INCRBY").arg(key).arg_int(delta))
    }

    /// `DECRBY key 1`.
    pub fn decr(&mut self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.decr_by(key, 1)
    }

    /// `DECRBY key delta`; returns the new value.
    pub fn decr_by(&mut self, key: impl AsRef<[u8]>, delta: i64) -> KvResult<i64> {
        self.call_int(Command::new("DECRBY").arg(key).arg_int(delta))
    }

    /// `KEYS pattern`.
    pub fn keys(&mut self, pattern: impl AsRef<[u8]>) -> KvResult<Vec<Vec<u8>>> {
        self.call_list(Command::new("KEYS").arg(pattern))
    }

    /// `HLEN key`.
    pub fn hlen(&mut self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.call_int(Command::new("HLEN").arg(key))
    }

    /// `HGET key field`.
    pub fn hget(
        &mut self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
    ) -> KvResult<Option<Vec<u8>>> {
        self.call_value(Command::new("HGET").arg(key).arg(field))
    }

    /// `HSET key field value`; returns the number of fields added.
    pub fn hset(
        &mut self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> KvResult<i64> {
        self.call_int(Command::new("HSET").arg(key).arg(field).arg(value))
    }

    /// `HDEL key field`; returns the number of fields removed.
    pub fn hdel(&mut self, key: impl AsRef<[u8]>, field: impl AsRef<[u8]>) -> KvResult<i64> {
        self.call_int(Command::new("HDEL").arg(key).arg(field))
    }

    /// `LPUSH key value`; returns the new list length.
    pub fn lpush(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> KvResult<i64> {
        self.call_int(Command::new("LPUSH").arg(key).arg(value))
    }

    /// `RPUSH key value`; returns the new list length.
    pub fn rpush(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> KvResult<i64> {
        self.call_int(Command::new("RPUSH").arg(key).arg(value))
    }

    /// Appends to the tail of a list (`RPUSH`).
    pub fn push(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> KvResult<i64> {
        self.rpush(key, value)
    }

    /// `LPOP key`.
    pub fn lpop(&mut self, key: impl AsRef<[u8]>) -> KvResult<Option<Vec<u8>>> {
        self.call_value(Command::new("LPOP").arg(key))
    }

    /// `RPOP key`.
    pub fn rpop(&mut self, key: impl AsRef<[u8]>) -> KvResult<Option<Vec<u8>>> {
        self.call_value(Command::new("RPOP").arg(key))
    }

    /// Takes from the head of a list (`LPOP`).
    pub fn pop(&mut self, key: impl AsRef<[u8]>) -> KvResult<Option<Vec<u8>>> {
        self.lpop(key)
    }

    /// `LRANGE key start stop`.
    pub fn lrange(
        &mut self,
        key: impl AsRef<[u8]>,
        start: i64,
        stop: i64,
    ) -> KvResult<Vec<Vec<u8>>> {
        self.call_list(Command::new("LRANGE").arg(key).arg_int(start).arg_int(stop))
    }

    /// `ZADD key score member`; returns the number of members added.
    pub fn zadd(
        &mut self,
        key: impl AsRef<[u8]>,
        score: f64,
        member: impl AsRef<[u8]>,
    ) -> KvResult<i64> {
        self.call_int(Command::new("ZADD").arg(key).arg_float(score).arg(member))
    }

    /// `ZREM key member`; returns the number of members removed.
    pub fn zrem(&mut self, key: impl AsRef<[u8]>, member: impl AsRef<[u8]>) -> KvResult<i64> {
        self.call_int(Command::new("ZREM").arg(key).arg(member))
    }

    /// `ZRANGE key start stop [WITHSCORES]`.
    ///
    /// With scores, members and scores alternate in the result.
    pub fn zrange(
        &mut self,
        key: impl AsRef<[u8]>,
        start: i64,
        stop: i64,
        with_scores: bool,
    ) -> KvResult<Vec<Vec<u8>>> {
        let mut cmd = Command::new("ZRANGE").arg(key).arg_int(start).arg_int(stop);
        if with_scores {
            cmd = cmd.arg("WITHSCORES");
        }
        self.call_list(cmd)
    }

    /// `EVAL script numkeys key... arg...`.
    pub fn eval<K, A>(&mut self, script: &str, keys: &[K], args: &[A]) -> KvResult<Reply>
    where
        K: AsRef<[u8]>,
        A: AsRef<[u8]>,
    {
        let mut cmd = Command::new("EVAL").arg(script).arg_uint(keys.len() as u64);
        for key in keys {
            cmd.push_arg(key);
        }
        for arg in args {
            cmd.push_arg(arg);
        }
        self.call(cmd)
    }
}
