//! # Resource Pool
//!
//! Purpose: Keep a bounded set of reusable resources (connections in
//! practice) and hand each one to exactly one caller at a time.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Slots hold resources between checkouts.
//! 2. **Reserve Before Create**: A slot is claimed under the mutex before the
//!    creator runs, so `max_size` is a hard bound on live resources.
//! 3. **Minimal Locking**: The creator and resource drops run outside the
//!    mutex; the critical section only moves values between slots.
//! 4. **RAII Checkout**: `Pooled<T>` owns the resource and returns it to its
//!    slot on drop.
//!
//! ## Slot Lifecycle
//!
//! ```text
//! empty ──reserve──> creating ──ok──> checked out ──release──> idle
//!   ^                   │ err              │ disable             │ stale
//!   └───────────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! Reconfiguring the pool bumps its generation and empties every slot;
//! checkouts from an older generation are dropped when released.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kvlink_common::{ErrorCode, KvError, KvResult};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// A resource is recreated after this many checkouts.
pub const MAX_USES: u32 = 100;

/// How long `get` keeps retrying before giving up.
pub const ACQUIRE_GRACE: Duration = Duration::from_secs(3);

/// Pause between two attempts inside the grace window.
pub const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Factory producing a fresh resource.
pub type Creator<T> = Arc<dyn Fn() -> KvResult<T> + Send + Sync>;

struct Slot<T> {
    resource: Option<T>,
    checked_out: bool,
    uses: u32,
    last_used: Instant,
}

impl<T> Slot<T> {
    fn reserved(now: Instant) -> Self {
        Slot {
            resource: None,
            checked_out: true,
            uses: 1,
            last_used: now,
        }
    }

    fn reserve(&mut self, now: Instant) {
        self.checked_out = true;
        self.uses = 1;
        self.last_used = now;
    }
}

struct PoolState<T> {
    slots: Vec<Slot<T>>,
    max_size: usize,
    timeout: Duration,
    creator: Option<Creator<T>>,
    generation: u64,
}

impl<T> PoolState<T> {
    /// Empties every slot and returns what they held.
    fn invalidate(&mut self) -> Vec<T> {
        self.generation += 1;
        self.slots
            .drain(..)
            .filter_map(|slot| slot.resource)
            .collect()
    }
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    released: Condvar,
}

enum Reservation<T> {
    Ready(T, usize),
    Create(usize),
    Detached,
}

/// Bounded pool of resources, shared by cloning the handle.
pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        ResourcePool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResourcePool")
            .field("len", &state.slots.len())
            .field("max_size", &state.max_size)
            .field("timeout", &state.timeout)
            .field("generation", &state.generation)
            .finish()
    }
}

impl<T> ResourcePool<T> {
    /// Creates a pool without a creator; `acquire` fails until one is set.
    ///
    /// A zero `timeout` disables pooling: every checkout gets a fresh resource.
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        ResourcePool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    slots: Vec::with_capacity(max_size),
                    max_size,
                    timeout,
                    creator: None,
                    generation: 0,
                }),
                released: Condvar::new(),
            }),
        }
    }

    /// Creates a pool with its creator.
    pub fn with_creator<F>(max_size: usize, timeout: Duration, creator: F) -> Self
    where
        F: Fn() -> KvResult<T> + Send + Sync + 'static,
    {
        let pool = ResourcePool::new(max_size, timeout);
        pool.inner.state.lock().creator = Some(Arc::new(creator));
        pool
    }

    /// Checks out a resource without waiting.
    ///
    /// Fails with `SYSBUSY` when every slot is checked out and the pool is
    /// full, or with the creator's error when a new resource cannot be made.
    pub fn acquire(&self) -> KvResult<Pooled<T>> {
        let mut evicted = Vec::new();
        let reserved = self.reserve(&mut evicted);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicting stale pooled resources");
        }
        drop(evicted);

        let (reservation, creator, generation) = reserved?;
        let idx = match reservation {
            Reservation::Ready(resource, idx) => {
                return Ok(Pooled::new(&self.inner, resource, Some((idx, generation))));
            }
            Reservation::Detached => {
                let resource = creator()?;
                return Ok(Pooled::new(&self.inner, resource, None));
            }
            Reservation::Create(idx) => idx,
        };

        match creator() {
            Ok(resource) => {
                debug!(slot = idx, generation, "pooled resource created");
                Ok(Pooled::new(&self.inner, resource, Some((idx, generation))))
            }
            Err(err) => {
                debug!(slot = idx, error = %err, "pooled resource creation failed");
                self.vacate(idx, generation);
                Err(err)
            }
        }
    }

    /// Checks out a resource, retrying for up to `ACQUIRE_GRACE`.
    ///
    /// Waiters wake early when another caller releases a resource.
    pub fn get(&self) -> KvResult<Pooled<T>> {
        let deadline = Instant::now() + ACQUIRE_GRACE;
        loop {
            let err = match self.acquire() {
                Ok(pooled) => return Ok(pooled),
                Err(err) if err.kind() == ErrorCode::ParamErr => return Err(err),
                Err(err) => err,
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(error = %err, grace = ?ACQUIRE_GRACE, "pool acquisition gave up");
                return Err(err);
            }
            let wait = ACQUIRE_RETRY_INTERVAL.min(deadline - now);
            let mut state = self.inner.state.lock();
            let _ = self.inner.released.wait_for(&mut state, wait);
        }
    }

    /// Drops a checked-out resource and empties its slot.
    pub fn disable(&self, pooled: Pooled<T>) {
        pooled.disable();
    }

    /// Returns a checked-out resource to its slot.
    pub fn release(&self, pooled: Pooled<T>) {
        pooled.release();
    }

    /// Changes the capacity and invalidates every slot.
    pub fn set_length(&self, max_size: usize) {
        let stale = {
            let mut state = self.inner.state.lock();
            state.max_size = max_size;
            state.invalidate()
        };
        debug!(max_size, "pool resized");
        drop(stale);
    }

    /// Changes the idle timeout and invalidates every slot.
    pub fn set_timeout(&self, timeout: Duration) {
        let stale = {
            let mut state = self.inner.state.lock();
            state.timeout = timeout;
            state.invalidate()
        };
        drop(stale);
    }

    /// Replaces the creator and invalidates every slot.
    pub fn set_creator<F>(&self, creator: F)
    where
        F: Fn() -> KvResult<T> + Send + Sync + 'static,
    {
        let stale = {
            let mut state = self.inner.state.lock();
            state.creator = Some(Arc::new(creator));
            state.invalidate()
        };
        drop(stale);
    }

    /// Drops every pooled resource.
    pub fn clear(&self) {
        let stale = self.inner.state.lock().invalidate();
        debug!(count = stale.len(), "pool cleared");
        drop(stale);
    }

    /// Number of live resources (idle, checked out, or being created).
    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.checked_out || slot.resource.is_some())
            .count()
    }

    /// Returns true when no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the pool.
    pub fn max_size(&self) -> usize {
        self.inner.state.lock().max_size
    }

    /// Idle timeout after which a resource is recreated.
    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }

    /// Number of idle resources ready for checkout.
    pub fn available(&self) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| !slot.checked_out && slot.resource.is_some())
            .count()
    }

    fn reserve(&self, evicted: &mut Vec<T>) -> KvResult<(Reservation<T>, Creator<T>, u64)> {
        let mut state = self.inner.state.lock();
        let Some(creator) = state.creator.clone() else {
            return Err(KvError::new(ErrorCode::ParamErr, "pool has no creator"));
        };
        let generation = state.generation;
        if state.timeout.is_zero() {
            return Ok((Reservation::Detached, creator, generation));
        }

        let now = Instant::now();
        let timeout = state.timeout;
        let mut vacant = None;
        for (idx, slot) in state.slots.iter_mut().enumerate() {
            if slot.checked_out {
                continue;
            }
            match slot.resource.take() {
                Some(resource)
                    if slot.uses < MAX_USES
                        && now.saturating_duration_since(slot.last_used) <= timeout =>
                {
                    slot.checked_out = true;
                    slot.uses += 1;
                    slot.last_used = now;
                    return Ok((Reservation::Ready(resource, idx), creator, generation));
                }
                Some(resource) => {
                    evicted.push(resource);
                    vacant.get_or_insert(idx);
                }
                None => {
                    vacant.get_or_insert(idx);
                }
            }
        }

        if let Some(idx) = vacant {
            state.slots[idx].reserve(now);
            return Ok((Reservation::Create(idx), creator, generation));
        }
        if state.slots.len() < state.max_size {
            state.slots.push(Slot::reserved(now));
            return Ok((Reservation::Create(state.slots.len() - 1), creator, generation));
        }
        Err(KvError::from_code(ErrorCode::SysBusy))
    }

    fn vacate(&self, idx: usize, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.generation == generation {
            if let Some(slot) = state.slots.get_mut(idx) {
                slot.checked_out = false;
                slot.resource = None;
            }
        }
        drop(state);
        self.inner.released.notify_one();
    }
}

/// A checked-out resource; goes back to its slot when dropped.
pub struct Pooled<T> {
    pool: Arc<PoolInner<T>>,
    resource: Option<T>,
    slot: Option<(usize, u64)>,
}

impl<T> Pooled<T> {
    fn new(pool: &Arc<PoolInner<T>>, resource: T, slot: Option<(usize, u64)>) -> Self {
        Pooled {
            pool: Arc::clone(pool),
            resource: Some(resource),
            slot,
        }
    }

    /// Returns true when the resource bypasses the pool.
    pub fn is_detached(&self) -> bool {
        self.slot.is_none()
    }

    /// Returns the resource to its slot now.
    pub fn release(self) {
        drop(self);
    }

    /// Drops the resource and empties its slot so the next checkout
    /// creates a new one.
    pub fn disable(mut self) {
        let resource = self.resource.take();
        if let Some((idx, generation)) = self.slot.take() {
            let mut state = self.pool.state.lock();
            if state.generation == generation {
                if let Some(slot) = state.slots.get_mut(idx) {
                    slot.checked_out = false;
                    slot.resource = None;
                    slot.uses = 0;
                }
            }
            drop(state);
            debug!(slot = idx, "pooled resource disabled");
            self.pool.released.notify_one();
        }
        drop(resource);
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("pooled resource present")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("pooled resource present")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let Some((idx, generation)) = self.slot.take() else {
            return;
        };

        let mut state = self.pool.state.lock();
        let current = state.generation == generation;
        let orphan = match state.slots.get_mut(idx) {
            Some(slot) if current && slot.checked_out => {
                slot.resource = Some(resource);
                slot.checked_out = false;
                None
            }
            // Slot belongs to an older generation.
            _ => Some(resource),
        };
        drop(state);
        if orphan.is_none() {
            self.pool.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(
        max_size: usize,
        timeout: Duration,
    ) -> (ResourcePool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ResourcePool::with_creator(max_size, timeout, move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });
        (pool, created)
    }

    #[test]
    fn released_resource_is_reused() {
        let (pool, created) = counting_pool(2, Duration::from_secs(60));
        let first = pool.acquire().unwrap();
        assert_eq!(*first, 0);
        first.release();

        let again = pool.acquire().unwrap();
        assert_eq!(*again, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn checked_out_resources_are_exclusive() {
        let (pool, _) = counting_pool(3, Duration::from_secs(60));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        let seen: HashSet<usize> = [*a, *b, *c].into_iter().collect();
        assert_eq!(seen.len(), 3);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn full_pool_reports_busy_without_waiting() {
        let (pool, _) = counting_pool(1, Duration::from_secs(60));
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        let err = pool.acquire().err().unwrap();
        assert_eq!(err.kind(), ErrorCode::SysBusy);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn get_waits_for_the_grace_window() {
        let (pool, _) = counting_pool(1, Duration::from_secs(60));
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        let err = pool.get().err().unwrap();
        let waited = start.elapsed();
        assert_eq!(err.kind(), ErrorCode::SysBusy);
        assert!(waited >= ACQUIRE_GRACE);
        assert!(waited < ACQUIRE_GRACE + Duration::from_secs(1));
    }

    #[test]
    fn get_wakes_when_a_resource_is_released() {
        let (pool, _) = counting_pool(1, Duration::from_secs(60));
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.get().map(|res| *res))
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn disabled_resource_is_recreated() {
        let (pool, created) = counting_pool(1, Duration::from_secs(60));
        let first = pool.acquire().unwrap();
        pool.disable(first);
        assert_eq!(pool.available(), 0);

        let second = pool.acquire().unwrap();
        assert_eq!(*second, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn idle_resource_expires() {
        let (pool, _) = counting_pool(1, Duration::from_millis(20));
        pool.acquire().unwrap().release();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(*pool.acquire().unwrap(), 1);
    }

    #[test]
    fn resource_is_recreated_after_use_ceiling() {
        let (pool, _) = counting_pool(1, Duration::from_secs(60));
        for _ in 0..MAX_USES {
            assert_eq!(*pool.acquire().unwrap(), 0);
        }
        assert_eq!(*pool.acquire().unwrap(), 1);
    }

    #[test]
    fn reconfiguring_invalidates_outstanding_checkouts() {
        let (pool, created) = counting_pool(2, Duration::from_secs(60));
        let held = pool.acquire().unwrap();
        pool.acquire().unwrap().release();
        assert_eq!(pool.len(), 2);

        pool.set_length(4);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.max_size(), 4);
        drop(held);
        assert_eq!(pool.available(), 0);

        assert_eq!(*pool.acquire().unwrap(), 2);
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_timeout_detaches_checkouts() {
        let (pool, created) = counting_pool(1, Duration::ZERO);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(a.is_detached() && b.is_detached());
        drop((a, b));
        assert_eq!(pool.len(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn creator_failure_frees_the_reservation() {
        let pool: ResourcePool<usize> =
            ResourcePool::with_creator(1, Duration::from_secs(60), || {
                Err(KvError::from_code(ErrorCode::NetErr))
            });
        assert_eq!(pool.acquire().err().unwrap().kind(), ErrorCode::NetErr);

        pool.set_creator(|| Ok(7));
        assert_eq!(*pool.acquire().unwrap(), 7);
    }

    #[test]
    fn missing_creator_is_a_parameter_error() {
        let pool: ResourcePool<usize> = ResourcePool::new(1, Duration::from_secs(1));
        assert_eq!(pool.get().err().unwrap().kind(), ErrorCode::ParamErr);
        assert!(pool.is_empty());
    }

    #[test]
    fn concurrent_checkouts_never_share() {
        let (pool, _) = counting_pool(4, Duration::from_secs(60));
        let in_use = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = Arc::clone(&in_use);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let res = pool.get().unwrap();
                        assert!(in_use.lock().insert(*res));
                        std::thread::yield_now();
                        assert!(in_use.lock().remove(&*res));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.len() <= 4);
    }
}
