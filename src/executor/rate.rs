//! The arrival-rate disciplines: constant-arrival-rate and
//! ramping-arrival-rate.
//!
//! The scheduling authority here is the rate, not the VU count. A governor
//! loop walks the stage list, interpolates the instantaneous rate once per
//! tick, and converts it into discrete iteration-start events with a
//! fractional carry so the long-run average is exact. Each event must find
//! a VU *now*: an idle one from the pool, else a freshly grown one below
//! `max_vus`, else the event is dropped and counted — it never queues,
//! because queued starts would silently turn a rate contract back into a
//! concurrency contract.
//!
//! Both disciplines share one implementation; a constant rate is just a
//! zero-duration jump followed by a single hold stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::stage::{Stage, arrivals_for_tick};
use super::{Executor, ExecutorReport, Outcome, RunContext, TICK, record_drop, run_iteration};
use crate::pool::VuPool;

pub(crate) struct ArrivalRate {
    /// Per-second rate profile; zero-duration stages jump the rate.
    pub stages: Vec<Stage>,
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
}

#[async_trait]
impl Executor for ArrivalRate {
    async fn run(&self, rcx: RunContext) -> ExecutorReport {
        let pool = Arc::new(VuPool::observed(
            self.pre_allocated_vus,
            self.max_vus,
            rcx.pool_sizes.clone(),
        ));
        pool.prewarm(self.pre_allocated_vus);

        let completed = Arc::new(AtomicU64::new(0));
        let mut started: u64 = 0;
        let mut dropped: u64 = 0;
        let mut workers = JoinSet::new();
        let mut stop = rcx.stop.clone();

        let mut rate = 0.0;
        let mut carry = 0.0;
        'stages: for stage in &self.stages {
            if stage.duration.is_zero() {
                rate = stage.target;
                continue;
            }
            let stage_start = Instant::now();
            let mut next_tick = Instant::now();
            let start_rate = rate;
            let end_rate = stage.target;

            loop {
                if rcx.stopped() {
                    break 'stages;
                }
                let elapsed = stage_start.elapsed();
                if elapsed >= stage.duration {
                    break;
                }
                next_tick += TICK;

                let (events, c) = arrivals_for_tick(
                    elapsed,
                    stage.duration,
                    start_rate,
                    end_rate,
                    carry,
                    TICK,
                );
                carry = c;
                for _ in 0..events {
                    started += 1;
                    let vu = pool.try_acquire().or_else(|| {
                        // Growth is attempted before giving up on the event.
                        (pool.grow(1) > 0).then(|| pool.try_acquire()).flatten()
                    });
                    match vu {
                        Some(mut vu) => {
                            let rcx = rcx.clone();
                            let pool = Arc::clone(&pool);
                            let completed = Arc::clone(&completed);
                            workers.spawn(async move {
                                run_iteration(&mut vu, &rcx).await;
                                completed.fetch_add(1, Ordering::Relaxed);
                                pool.release(vu);
                            });
                        }
                        None => {
                            dropped += 1;
                            record_drop(&rcx);
                            tracing::debug!(
                                scenario = %rcx.scenario.name,
                                "dropping iteration start, no vu available below max_vus"
                            );
                        }
                    }
                }
                // Reap finished iterations so the set stays small.
                while workers.try_join_next().is_some() {}

                tokio::select! {
                    _ = tokio::time::sleep_until(next_tick) => {}
                    Ok(_) = stop.wait_for(|s| *s) => break 'stages,
                }
            }
            // Land exactly on the stage target so the next stage ramps from
            // the right point instead of accumulating rounding error.
            rate = end_rate;
        }

        // In-flight iterations finish; nothing new starts.
        while workers.join_next().await.is_some() {}

        if dropped > 0 {
            tracing::warn!(
                scenario = %rcx.scenario.name,
                dropped,
                started,
                "iteration starts were dropped, consider raising max_vus"
            );
        }
        let outcome = if rcx.stopped() {
            Outcome::Aborted
        } else {
            Outcome::Completed
        };
        ExecutorReport {
            outcome,
            started,
            completed: completed.load(Ordering::Relaxed),
            dropped,
            peak_vus: pool.peak_leased(),
        }
    }
}
