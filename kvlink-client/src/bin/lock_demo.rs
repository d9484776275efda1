//! # Lock Demo
//!
//! Purpose: Exercise the pooled client and the distributed lock from several
//! threads against a live server.
//!
//! Usage: `lock_demo [host[:port]] [workers]`. Log verbosity follows
//! `RUST_LOG` (default `info`).

use std::env;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use kvlink_client::{ClientConfig, KVClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_WORKERS: usize = 4;
const LOCK_KEY: &str = "kvlink:demo:lock";
const LOCK_TIMEOUT_SECS: u64 = 5;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_thread_names(true)
        .init();

    let mut args = env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let workers = match args.next() {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid worker count {:?}", raw))?,
        None => DEFAULT_WORKERS,
    };

    let config = ClientConfig {
        pool_size: workers.max(1),
        ..ClientConfig::with_addr(&addr)?
    };
    let client = KVClient::with_config(config)?;
    client.ping().with_context(|| format!("server at {} is not reachable", addr))?;
    info!(%addr, workers, "connected");

    let started = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|id| {
            let client = client.clone();
            thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || run_worker(&client, id))
        })
        .collect::<std::io::Result<_>>()?;

    let mut failed = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "worker failed");
                failed += 1;
            }
            Err(_) => failed += 1,
        }
    }

    info!(elapsed = ?started.elapsed(), failed, "demo finished");
    if failed > 0 {
        bail!("{} worker(s) failed", failed);
    }
    Ok(())
}

fn run_worker(client: &KVClient, id: usize) -> Result<()> {
    let key = format!("kvlink:demo:worker:{}", id);
    let value = format!("hello from worker {}", id);
    client.set_with_ttl(&key, &value, Duration::from_secs(60))?;
    let stored = client.get(&key)?.context("value vanished")?;
    info!(key = %key, value = %String::from_utf8_lossy(&stored), "round trip");

    let mut conn = client.connection()?;
    if !conn.lock(LOCK_KEY, LOCK_TIMEOUT_SECS)? {
        warn!("lock not acquired");
        return Ok(());
    }
    info!(token = %conn.lock_token(), "lock held");
    thread::sleep(Duration::from_millis(100));
    let released = conn.unlock(LOCK_KEY)?;
    info!(released, "lock released");
    Ok(())
}
