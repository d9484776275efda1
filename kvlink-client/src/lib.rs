//! # KVLink Sync Client
//!
//! Purpose: Provide a lightweight, synchronous Redis-compatible client with
//! connection pooling and an advisory distributed lock.
//!
//! ## Design Principles
//! 1. **Layered Stack**: transport -> RESP codec -> connection -> pool ->
//!    client facade; each layer only talks to the one below it.
//! 2. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Example
//!
//! ```no_run
//! use kvlink_client::KVClient;
//!
//! let client = KVClient::connect("127.0.0.1:6379")?;
//! client.set("greeting", "hello")?;
//! assert_eq!(client.get("greeting")?, Some(b"hello".to_vec()));
//!
//! if client.lock("jobs:nightly", 30)? {
//!     // critical section
//!     client.unlock("jobs:nightly")?;
//! }
//! # Ok::<(), kvlink_client::KvError>(())
//! ```

mod client;
mod command;
mod connection;
mod lock;
mod pool;
mod resp;
mod transport;

pub use client::{ClientConfig, KVClient, DEFAULT_PORT};
pub use command::{Command, Reply};
pub use connection::{
    Connection, KeyTtl, DEFAULT_BUFFER_CAPACITY, DEFAULT_SOCKET_TIMEOUT, DEFAULT_TIMEOUT,
};
pub use kvlink_common::{ErrorCode, KvError, KvResult, STATUS_OK};
pub use lock::LOCK_POLL_INTERVAL;
pub use pool::{Creator, Pooled, ResourcePool, ACQUIRE_GRACE, ACQUIRE_RETRY_INTERVAL, MAX_USES};
pub use resp::{
    encode_command, parse_value, RespDecoder, RespValue, MAX_BULK_SIZE, MAX_NESTING_DEPTH,
};
pub use transport::{Transport, RETRY_LIMIT};
