//! # Distributed Lock
//!
//! Purpose: Mutual exclusion between threads and processes sharing one
//! server, keyed by an arbitrary string.
//!
//! ## Design Principles
//! 1. **Owner Token**: Each thread writes a token unique to it
//!    (`<host-ip>:<pid>:<thread-seq>`, IPv6 hosts in brackets), so only
//!    the owner can release.
//! 2. **Lease, Not Hold**: The lock key carries an expiry; a crashed owner
//!    cannot block others past it.
//! 3. **Atomic Release**: Compare-and-delete runs server-side in one script.
//!
//! Acquisition is a poll loop on `SET key token NX EX secs`; a null reply
//! means another owner holds the key.

use std::cell::OnceCell;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use kvlink_common::{ErrorCode, KvError, KvResult};
use tracing::{debug, trace};

use crate::command::Command;
use crate::connection::Connection;

/// Delay between two acquisition attempts.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

const UNLOCK_SCRIPT: &str =
    "if redis.call('get',KEYS[1])==ARGV[1] then return redis.call('del',KEYS[1]) else return 0 end";

const UNKNOWN_HOST: &str = "unknown-host";

static THREAD_SEQ: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCK_TOKEN: OnceCell<String> = const { OnceCell::new() };
}

impl Connection {
    /// Takes `key` for `timeout_secs` seconds, waiting up to as long for it.
    pub fn lock(&mut self, key: &str, timeout_secs: u64) -> KvResult<bool> {
        let timeout = Duration::from_secs(timeout_secs);
        self.lock_with_wait(key, timeout, timeout)
    }

    /// Tries to take `key` for `lease`, polling until `wait` elapses.
    ///
    /// Returns `Ok(false)` when the key stays owned by someone else (or
    /// `wait` is zero). The lease is rounded up to whole seconds.
    pub fn lock_with_wait(
        &mut self,
        key: &str,
        lease: Duration,
        wait: Duration,
    ) -> KvResult<bool> {
        if key.is_empty() {
            return Err(KvError::new(ErrorCode::ParamErr, "lock key is empty"));
        }
        if wait.is_zero() {
            return Ok(false);
        }

        let token = self.lock_token();
        let seconds = lease_seconds(lease);
        let deadline = Instant::now() + wait;
        let mut attempts = 0u32;

        loop {
            if self.is_closed() {
                return Err(KvError::new(ErrorCode::NetClose, "connection is not open"));
            }

            attempts += 1;
            let cmd = Command::new("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("EX")
                .arg_uint(seconds);
            match self.call(cmd) {
                Ok(_) => {
                    debug!(key, attempts, lease_secs = seconds, "lock acquired");
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorCode::NotFound => {
                    trace!(key, attempts, "lock busy");
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key, attempts, "lock wait expired");
                return Ok(false);
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Releases `key` if this thread still owns it.
    ///
    /// Returns `Ok(false)` when the key is missing or owned by someone else.
    pub fn unlock(&mut self, key: &str) -> KvResult<bool> {
        if key.is_empty() {
            return Err(KvError::new(ErrorCode::ParamErr, "lock key is empty"));
        }
        let token = self.lock_token();
        let reply = self.eval(UNLOCK_SCRIPT, &[key], &[token.as_str()])?;
        let released = reply.status() > 0;
        debug!(key, released, "lock release");
        Ok(released)
    }

    /// Owner token of the calling thread.
    ///
    /// Built once per thread from the local address of the first connection
    /// that asks for it.
    pub fn lock_token(&self) -> String {
        LOCK_TOKEN.with(|cell| {
            cell.get_or_init(|| {
                let host = token_host(self.local_addr());
                let seq = THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
                format!("{}:{}:{}", host, std::process::id(), seq)
            })
            .clone()
        })
    }
}

/// IPv6 hosts are bracketed so the token still splits into three fields on
/// its last two colons.
fn token_host(addr: Option<SocketAddr>) -> String {
    match addr.map(|addr| addr.ip()) {
        Some(IpAddr::V4(ip)) => ip.to_string(),
        Some(IpAddr::V6(ip)) => format!("[{}]", ip),
        None => UNKNOWN_HOST.to_string(),
    }
}

fn lease_seconds(lease: Duration) -> u64 {
    let secs = lease.as_secs();
    if lease.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}
