//! Virtual-user pool — a bounded set of reusable execution slots.
//!
//! Each executor owns one pool; VUs are never shared across scenarios. A VU
//! is either idle (held by the pool), leased (running iterations for the
//! executor), or retired. Ownership expresses the lifecycle: leasing moves
//! the [`Vu`] out of the pool, releasing moves it back, and retirement drops
//! it.
//!
//! VUs are created lazily up to the pool's current capacity. `acquire` at
//! capacity suspends until a release or the timeout elapses; `try_acquire`
//! never suspends, which is what the arrival-rate executors need to decide
//! between growing the pool and counting a dropped iteration. `shrink`
//! never interrupts a leased VU: surplus leases are marked and retired at
//! their next release.
//!
//! Pool state is guarded by a single pool-scoped mutex; size changes are
//! published on a watch channel for scheduler diagnostics.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::error::Error;

/// A reusable execution slot. Runs at most one iteration body at a time;
/// its iteration counter survives lease cycles.
#[derive(Debug)]
pub struct Vu {
    pub id: u32,
    pub iterations: u64,
}

/// Live/leased counts as published on the pool's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSize {
    /// VUs in existence (idle + leased).
    pub live: usize,
    /// VUs currently leased to the executor.
    pub leased: usize,
}

struct PoolInner {
    idle: Vec<Vu>,
    live: usize,
    capacity: usize,
    pending_retire: usize,
    next_id: u32,
    peak_leased: usize,
}

impl PoolInner {
    fn leased(&self) -> usize {
        self.live - self.idle.len()
    }

    fn size(&self) -> PoolSize {
        PoolSize {
            live: self.live,
            leased: self.leased(),
        }
    }
}

pub struct VuPool {
    max: usize,
    inner: Mutex<PoolInner>,
    returned: Notify,
    sizes: watch::Sender<PoolSize>,
}

impl VuPool {
    /// A pool that may lease up to `capacity` VUs now and can be grown up
    /// to `max` later. VUs are created lazily on first lease.
    pub fn new(capacity: usize, max: usize) -> Self {
        let (sizes, _) = watch::channel(PoolSize::default());
        Self::observed(capacity, max, sizes)
    }

    /// Like [`VuPool::new`], publishing size changes on a caller-provided
    /// channel so the scheduler can watch them.
    pub fn observed(capacity: usize, max: usize, sizes: watch::Sender<PoolSize>) -> Self {
        debug_assert!(capacity <= max);
        Self {
            max,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                live: 0,
                capacity,
                pending_retire: 0,
                next_id: 0,
                peak_leased: 0,
            }),
            returned: Notify::new(),
            sizes,
        }
    }

    /// Eagerly create up to `n` idle VUs (bounded by current capacity).
    pub fn prewarm(&self, n: usize) {
        let mut inner = self.inner.lock();
        while inner.live < inner.capacity.min(n) {
            let vu = Vu {
                id: inner.next_id,
                iterations: 0,
            };
            inner.next_id += 1;
            inner.live += 1;
            inner.idle.push(vu);
        }
        self.sizes.send_replace(inner.size());
    }

    /// Lease a VU without suspending. Creates one if the pool is below
    /// capacity; `None` when every slot is leased.
    pub fn try_acquire(&self) -> Option<Vu> {
        let mut inner = self.inner.lock();
        let vu = match inner.idle.pop() {
            Some(vu) => vu,
            None if inner.live < inner.capacity => {
                let vu = Vu {
                    id: inner.next_id,
                    iterations: 0,
                };
                inner.next_id += 1;
                inner.live += 1;
                vu
            }
            None => return None,
        };
        let leased = inner.leased();
        if leased > inner.peak_leased {
            inner.peak_leased = leased;
        }
        self.sizes.send_replace(inner.size());
        Some(vu)
    }

    /// Lease a VU, suspending up to `wait` when the pool is at capacity.
    pub async fn acquire(&self, wait: Duration) -> Result<Vu, Error> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(vu) = self.try_acquire() {
                return Ok(vu);
            }
            let notified = self.returned.notified();
            // A release may have slipped in before we registered.
            if let Some(vu) = self.try_acquire() {
                return Ok(vu);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return match self.try_acquire() {
                    Some(vu) => Ok(vu),
                    None => Err(Error::ResourceExhausted {
                        capacity: self.inner.lock().capacity,
                        waited: wait,
                    }),
                };
            }
        }
    }

    /// Return a leased VU. Retires it instead if a shrink marked it.
    pub fn release(&self, vu: Vu) {
        let mut inner = self.inner.lock();
        if inner.pending_retire > 0 {
            inner.pending_retire -= 1;
            inner.live -= 1;
            tracing::debug!(vu = vu.id, "retiring vu on release");
        } else {
            inner.idle.push(vu);
        }
        self.sizes.send_replace(inner.size());
        drop(inner);
        self.returned.notify_one();
    }

    /// Raise capacity by up to `by`, bounded by the pool's hard maximum.
    /// Returns the capacity actually added.
    pub fn grow(&self, by: usize) -> usize {
        let mut inner = self.inner.lock();
        let added = by.min(self.max - inner.capacity);
        inner.capacity += added;
        drop(inner);
        if added > 0 {
            tracing::debug!(added, "vu pool grown");
            // Waiters blocked at the old capacity can now create VUs.
            self.returned.notify_waiters();
        }
        added
    }

    /// Lower capacity by up to `by`. Idle VUs retire immediately; leased
    /// VUs are marked and retire at their next release. Returns the count
    /// scheduled for removal.
    pub fn shrink(&self, by: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        while removed < by && inner.capacity > 0 {
            if let Some(vu) = inner.idle.pop() {
                tracing::debug!(vu = vu.id, "retiring idle vu");
                inner.live -= 1;
            } else if inner.leased() > inner.pending_retire {
                inner.pending_retire += 1;
            }
            // otherwise only an unlaunched slot is being removed
            inner.capacity -= 1;
            removed += 1;
        }
        self.sizes.send_replace(inner.size());
        removed
    }

    /// Observe live/leased counts as they change.
    pub fn sizes(&self) -> watch::Receiver<PoolSize> {
        self.sizes.subscribe()
    }

    /// Highest number of simultaneously leased VUs so far.
    pub fn peak_leased(&self) -> usize {
        self.inner.lock().peak_leased
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn leases_lazily_up_to_capacity() {
        let pool = VuPool::new(2, 2);
        let a = pool.try_acquire().expect("first lease");
        let b = pool.try_acquire().expect("second lease");
        assert_ne!(a.id, b.id);
        assert!(pool.try_acquire().is_none());
        pool.release(a);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn vu_iteration_counter_survives_lease_cycles() {
        let pool = VuPool::new(1, 1);
        let mut vu = pool.try_acquire().expect("lease");
        vu.iterations += 7;
        pool.release(vu);
        let vu = pool.try_acquire().expect("re-lease");
        assert_eq!(vu.iterations, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_suspends_until_release() {
        let pool = Arc::new(VuPool::new(1, 1));
        let vu = pool.try_acquire().expect("lease");
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.release(vu);
        let leased = waiter.await.expect("waiter task").expect("acquire");
        assert_eq!(leased.id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_with_resource_exhausted() {
        let pool = VuPool::new(1, 1);
        let _held = pool.try_acquire().expect("lease");
        let err = pool
            .acquire(Duration::from_secs(2))
            .await
            .expect_err("should time out");
        assert!(matches!(err, Error::ResourceExhausted { capacity: 1, .. }));
    }

    #[test]
    fn grow_is_bounded_by_max() {
        let pool = VuPool::new(2, 5);
        assert_eq!(pool.grow(10), 3);
        assert_eq!(pool.grow(1), 0);
        for _ in 0..5 {
            assert!(pool.try_acquire().is_some());
        }
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn shrink_retires_idle_now_and_leased_on_release() {
        let pool = VuPool::new(3, 3);
        let leased = pool.try_acquire().expect("lease");
        let idle = pool.try_acquire().expect("lease");
        pool.release(idle);

        assert_eq!(pool.shrink(2), 2);
        let size = *pool.sizes().borrow();
        assert_eq!(size.live, 1, "idle vu retired immediately");
        assert_eq!(size.leased, 1, "leased vu still running");

        pool.release(leased);
        let size = *pool.sizes().borrow();
        assert_eq!(size.live, 0, "marked vu retired on release");
        assert_eq!(size.leased, 0);
    }

    #[test]
    fn watch_publishes_leased_counts_and_peak() {
        let pool = VuPool::new(2, 2);
        let rx = pool.sizes();
        let a = pool.try_acquire().expect("lease");
        let b = pool.try_acquire().expect("lease");
        assert_eq!(rx.borrow().leased, 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(rx.borrow().leased, 0);
        assert_eq!(pool.peak_leased(), 2);
    }

    #[test]
    fn prewarm_creates_idle_vus() {
        let pool = VuPool::new(4, 8);
        pool.prewarm(4);
        assert_eq!(pool.sizes().borrow().live, 4);
        assert_eq!(pool.sizes().borrow().leased, 0);
    }
}
