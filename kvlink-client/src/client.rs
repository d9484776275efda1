//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API over a pool of authenticated
//! connections to a Redis-compatible server.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling, reconnects and protocol
//!    details behind one-shot helpers.
//! 2. **Explicit Construction**: No process-wide instance; callers build a
//!    client and share it by cloning the handle.
//! 3. **Evict on Desync**: A connection that failed at the transport level
//!    is disabled instead of going back to the pool.

use std::sync::Arc;
use std::time::Duration;

use kvlink_common::{ErrorCode, KvError, KvResult};
use serde::Deserialize;
use tracing::debug;

use crate::command::Reply;
use crate::connection::{Connection, KeyTtl, DEFAULT_BUFFER_CAPACITY};
use crate::pool::{Pooled, ResourcePool};

/// Port used when an address carries none.
pub const DEFAULT_PORT: u16 = 6379;

/// Configuration for the client and its pool.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Password sent with `AUTH`; empty skips authentication.
    pub password: String,
    /// Logical timeout for connect and for each command.
    pub timeout_ms: u64,
    /// Receive buffer capacity per connection.
    pub buffer_capacity: usize,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
    /// Idle time after which a pooled connection is recreated; 0 disables pooling.
    pub idle_timeout_secs: u64,
    /// Socket-level send/receive timeout.
    pub socket_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: String::new(),
            timeout_ms: 3000,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            pool_size: 8,
            idle_timeout_secs: 60,
            socket_timeout_ms: 10,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at `host[:port]`.
    pub fn with_addr(addr: &str) -> KvResult<Self> {
        let (host, port) = split_addr(addr)?;
        Ok(ClientConfig {
            host,
            port,
            ..ClientConfig::default()
        })
    }

    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> KvResult<Self> {
        serde_json::from_str(json).map_err(|err| {
            KvError::new(ErrorCode::ParamErr, format!("invalid client config: {}", err))
        })
    }

    /// Logical timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pool idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Socket timeout as a duration.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Opens one authenticated connection with these settings.
    pub fn open_connection(&self) -> KvResult<Connection> {
        let mut conn = Connection::new().with_socket_timeout(self.socket_timeout());
        conn.connect(&self.host, self.port, self.timeout(), self.buffer_capacity)?;
        conn.authenticate(&self.password)?;
        Ok(conn)
    }

    fn validate(&self) -> KvResult<()> {
        if self.host.is_empty() {
            return Err(KvError::new(ErrorCode::ParamErr, "host is empty"));
        }
        if self.pool_size == 0 {
            return Err(KvError::new(ErrorCode::ParamErr, "pool size must be positive"));
        }
        if self.timeout_ms == 0 {
            return Err(KvError::new(ErrorCode::ParamErr, "timeout must be positive"));
        }
        if self.buffer_capacity == 0 {
            return Err(KvError::new(
                ErrorCode::ParamErr,
                "buffer capacity must be positive",
            ));
        }
        Ok(())
    }
}

/// Splits `host[:port]`; a bracketed IPv6 host keeps its colons.
fn split_addr(addr: &str) -> KvResult<(String, u16)> {
    let addr = addr.trim();
    let invalid = || KvError::new(ErrorCode::ParamErr, format!("invalid address {:?}", addr));

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match addr.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (addr, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_PORT,
    };
    Ok((host.to_string(), port))
}

/// Synchronous client with connection pooling.
///
/// Each one-shot helper checks out a connection, runs one command, and
/// returns the connection to the pool.
#[derive(Debug, Clone)]
pub struct KVClient {
    config: Arc<ClientConfig>,
    pool: ResourcePool<Connection>,
}

impl KVClient {
    /// Creates a client for `host[:port]` with default settings.
    pub fn connect(addr: &str) -> KvResult<Self> {
        Self::with_config(ClientConfig::with_addr(addr)?)
    }

    /// Creates a client with a custom configuration.
    ///
    /// Connections are opened lazily on first checkout.
    pub fn with_config(config: ClientConfig) -> KvResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let factory = Arc::clone(&config);
        let pool = ResourcePool::with_creator(config.pool_size, config.idle_timeout(), move || {
            factory.open_connection()
        });
        debug!(
            host = %config.host,
            port = config.port,
            pool_size = config.pool_size,
            "client configured"
        );
        Ok(KVClient { config, pool })
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &ResourcePool<Connection> {
        &self.pool
    }

    /// Checks out a healthy connection.
    ///
    /// Connections left closed or desynchronized by an earlier caller are
    /// disabled and replaced.
    pub fn connection(&self) -> KvResult<Pooled<Connection>> {
        for _ in 0..=self.config.pool_size {
            let conn = self.pool.get()?;
            if conn.is_healthy() {
                return Ok(conn);
            }
            debug!(code = conn.error_code(), "replacing unhealthy pooled connection");
            conn.disable();
        }
        Err(KvError::new(
            ErrorCode::NetErr,
            "no healthy connection available",
        ))
    }

    /// Runs `f` on a checked-out connection.
    ///
    /// The connection is disabled when `f` fails and leaves it unhealthy.
    /// Argument errors rejected before any I/O keep it in the pool.
    pub fn with_connection<R, F>(&self, f: F) -> KvResult<R>
    where
        F: FnOnce(&mut Connection) -> KvResult<R>,
    {
        let mut conn = self.connection()?;
        let result = f(&mut *conn);
        if let Err(err) = &result {
            if !conn.is_healthy() {
                debug!(error = %err, "disabling connection after failure");
                conn.disable();
            }
        }
        result
    }

    /// Runs a command given as plain arguments (name first).
    pub fn execute<I, A>(&self, args: I) -> KvResult<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.with_connection(|conn| conn.execute_args(args))
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: impl AsRef<[u8]>) -> KvResult<Option<Vec<u8>>> {
        self.with_connection(|conn| conn.get(key))
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> KvResult<()> {
        self.with_connection(|conn| conn.set(key, value))
    }

    /// Sets a value and attaches an expiration in seconds.
    pub fn set_with_ttl(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> KvResult<()> {
        self.with_connection(|conn| conn.set_with_ttl(key, value, ttl))
    }

    /// Deletes a key. Returns the number of keys removed.
    pub fn del(&self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.with_connection(|conn| conn.del(key))
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: impl AsRef<[u8]>, seconds: u64) -> KvResult<bool> {
        self.with_connection(|conn| conn.expire(key, seconds))
    }

    /// Returns TTL status for a key.
    pub fn ttl(&self, key: impl AsRef<[u8]>) -> KvResult<KeyTtl> {
        self.with_connection(|conn| conn.ttl(key))
    }

    /// Pings the server.
    pub fn ping(&self) -> KvResult<()> {
        self.with_connection(Connection::ping)
    }

    /// Takes a distributed lock for `timeout_secs` seconds.
    pub fn lock(&self, key: &str, timeout_secs: u64) -> KvResult<bool> {
        self.with_connection(|conn| conn.lock(key, timeout_secs))
    }

    /// Releases a distributed lock held by the calling thread.
    pub fn unlock(&self, key: &str) -> KvResult<bool> {
        self.with_connection(|conn| conn.unlock(key))
    }
}
