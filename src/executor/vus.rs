//! The fixed- and ramping-concurrency disciplines: constant-vus and
//! ramping-vus.
//!
//! Workers loop back-to-back; throughput is whatever iteration duration
//! allows. Ramping re-plans the desired VU count on every tick by linear
//! interpolation over the stage list, leases extra VUs from the pool when
//! the plan rises, and signals surplus workers to retire at their next
//! iteration boundary when it falls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::stage::{Stage, level_at, total_duration};
use super::{Executor, ExecutorReport, Outcome, RunContext, TICK, run_iteration};
use crate::pool::{Vu, VuPool};

pub(crate) struct ConstantVus {
    pub vus: usize,
    pub duration: Duration,
}

#[async_trait]
impl Executor for ConstantVus {
    async fn run(&self, rcx: RunContext) -> ExecutorReport {
        let pool = Arc::new(VuPool::observed(
            self.vus,
            self.vus,
            rcx.pool_sizes.clone(),
        ));
        let completed = Arc::new(AtomicU64::new(0));
        let deadline = Instant::now() + self.duration;

        let mut workers = JoinSet::new();
        for _ in 0..self.vus {
            let Some(mut vu) = pool.try_acquire() else {
                break;
            };
            let rcx = rcx.clone();
            let pool = Arc::clone(&pool);
            let completed = Arc::clone(&completed);
            workers.spawn(async move {
                while !rcx.stopped() && Instant::now() < deadline {
                    run_iteration(&mut vu, &rcx).await;
                    completed.fetch_add(1, Ordering::Relaxed);
                }
                pool.release(vu);
            });
        }
        while workers.join_next().await.is_some() {}

        let completed = completed.load(Ordering::Relaxed);
        let outcome = if rcx.stopped() {
            Outcome::Aborted
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

pub(crate) struct RampingVus {
    pub start_vus: usize,
    pub stages: Vec<Stage>,
}

impl RampingVus {
    /// Highest VU count the profile can demand.
    fn max_vus(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_vus as f64, f64::max)
            .ceil() as usize
    }
}

#[async_trait]
impl Executor for RampingVus {
    async fn run(&self, rcx: RunContext) -> ExecutorReport {
        let max = self.max_vus();
        let pool = Arc::new(VuPool::observed(max, max, rcx.pool_sizes.clone()));
        let completed = Arc::new(AtomicU64::new(0));
        let profile_end = total_duration(&self.stages);
        let started_at = Instant::now();

        let mut workers = JoinSet::new();
        // Retirement signals for currently-active workers, newest last.
        let mut active: Vec<watch::Sender<bool>> = Vec::new();
        let mut stop = rcx.stop.clone();
        let mut next_tick = Instant::now();

        loop {
            let elapsed = started_at.elapsed();
            if elapsed >= profile_end || rcx.stopped() {
                break;
            }
            let desired = level_at(self.start_vus as f64, &self.stages, elapsed).round() as usize;
            while active.len() < desired {
                let Some(vu) = pool.try_acquire() else {
                    break;
                };
                let (retire_tx, retire_rx) = watch::channel(false);
                active.push(retire_tx);
                workers.spawn(vu_loop(
                    vu,
                    retire_rx,
                    rcx.clone(),
                    Arc::clone(&pool),
                    Arc::clone(&completed),
                ));
            }
            while active.len() > desired {
                if let Some(retire_tx) = active.pop() {
                    let _ = retire_tx.send(true);
                }
            }
            next_tick += TICK;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                Ok(_) = stop.wait_for(|s| *s) => break,
            }
        }

        for retire_tx in active {
            let _ = retire_tx.send(true);
        }
        while workers.join_next().await.is_some() {}

        let completed = completed.load(Ordering::Relaxed);
        let outcome = if rcx.stopped() {
            Outcome::Aborted
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

async fn vu_loop(
    mut vu: Vu,
    retire: watch::Receiver<bool>,
    rcx: RunContext,
    pool: Arc<VuPool>,
    completed: Arc<AtomicU64>,
) {
    while !rcx.stopped() && !*retire.borrow() {
        run_iteration(&mut vu, &rcx).await;
        completed.fetch_add(1, Ordering::Relaxed);
    }
    pool.release(vu);
}
