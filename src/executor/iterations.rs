//! The iteration-counted disciplines: shared-iterations and
//! per-vu-iterations.
//!
//! Both run a fixed body of work and stop early only on the duration cap
//! or the scheduler's stop signal. The shared variant lets N VUs race to
//! drain one counter (claim-then-run, so the total can never overshoot);
//! the per-VU variant gives each VU its own quota and lets everyone
//! proceed at their own pace.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::{Executor, ExecutorReport, Outcome, RunContext, run_iteration};
use crate::pool::VuPool;

pub(crate) struct SharedIterations {
    pub vus: usize,
    pub iterations: u64,
    pub max_duration: Duration,
}

#[async_trait]
impl Executor for SharedIterations {
    async fn run(&self, rcx: RunContext) -> ExecutorReport {
        let pool = Arc::new(VuPool::observed(
            self.vus,
            self.vus,
            rcx.pool_sizes.clone(),
        ));
        let remaining = Arc::new(AtomicU64::new(self.iterations));
        let completed = Arc::new(AtomicU64::new(0));
        let deadline = Instant::now() + self.max_duration;

        let mut workers = JoinSet::new();
        for _ in 0..self.vus {
            let Some(mut vu) = pool.try_acquire() else {
                break;
            };
            let rcx = rcx.clone();
            let pool = Arc::clone(&pool);
            let remaining = Arc::clone(&remaining);
            let completed = Arc::clone(&completed);
            workers.spawn(async move {
                loop {
                    if rcx.stopped() || Instant::now() >= deadline {
                        break;
                    }
                    // Claim before running, so the total can never overshoot.
                    let claimed = remaining
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                        .is_ok();
                    if !claimed {
                        break;
                    }
                    run_iteration(&mut vu, &rcx).await;
                    completed.fetch_add(1, Ordering::Relaxed);
                }
                pool.release(vu);
            });
        }
        while workers.join_next().await.is_some() {}

        let leftover = remaining.load(Ordering::Acquire);
        let outcome = if rcx.stopped() {
            Outcome::Aborted
        } else if leftover > 0 {
            tracing::warn!(
                error = %crate::error::Error::Timeout {
                    scenario: rcx.scenario.name.to_string(),
                },
                leftover,
                "shared iteration counter not drained"
            );
            Outcome::TimedOut
        } else {
            Outcome::Completed
        };
        ExecutorReport {
            outcome,
            started: self.iterations - leftover,
            completed: completed.load(Ordering::Relaxed),
            dropped: 0,
            peak_vus: pool.peak_leased(),
        }
    }
}

pub(crate) struct PerVuIterations {
    pub vus: usize,
    pub iterations: u64,
    pub max_duration: Duration,
}

#[async_trait]
impl Executor for PerVuIterations {
    async fn run(&self, rcx: RunContext) -> ExecutorReport {
        let pool = Arc::new(VuPool::observed(
            self.vus,
            self.vus,
            rcx.pool_sizes.clone(),
        ));
        let completed = Arc::new(AtomicU64::new(0));
        let deadline = Instant::now() + self.max_duration;

        let mut workers = JoinSet::new();
        for _ in 0..self.vus {
            let Some(mut vu) = pool.try_acquire() else {
                break;
            };
            let rcx = rcx.clone();
            let pool = Arc::clone(&pool);
            let completed = Arc::clone(&completed);
            let quota = self.iterations;
            workers.spawn(async move {
                for _ in 0..quota {
                    if rcx.stopped() || Instant::now() >= deadline {
                        break;
                    }
                    run_iteration(&mut vu, &rcx).await;
                    completed.fetch_add(1, Ordering::Relaxed);
                }
                pool.release(vu);
            });
        }
        while workers.join_next().await.is_some() {}

        let completed = completed.load(Ordering::Relaxed);
        let intended = self.vus as u64 * self.iterations;
        let outcome = if rcx.stopped() {
            Outcome::Aborted
        } else if completed < intended {
            tracing::warn!(
                error = %crate::error::Error::Timeout {
                    scenario: rcx.scenario.name.to_string(),
                },
                completed,
                intended,
                "not every vu finished its quota"
            );
            Outcome::TimedOut
        } else {
            Outcome::Completed
        };
        ExecutorReport {
            outcome,
            started: completed,
            completed,
            dropped: 0,
            peak_vus: pool.peak_leased(),
        }
    }
}
