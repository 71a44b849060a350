//! The scenario scheduler — owns the run from validated configuration to
//! final summary.
//!
//! Each scenario's executor starts at `run_start + start_time` and runs on
//! its own VU pool; all executors share one metric registry and one stop
//! signal. Abort-on-fail thresholds are re-evaluated on a periodic tick
//! while the run is live; the first failure flips the stop signal and the
//! remaining executors wind down at their next iteration boundary. The run
//! is done when every executor reaches a terminal state, and it always
//! produces a summary — aborts and timeouts are recorded, not thrown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::clock::RunClock;
use crate::error::Error;
use crate::executor::{self, ExecutorReport, Outcome, RunContext, ScenarioRuntime};
use crate::metrics::threshold::{Threshold, ThresholdResult};
use crate::metrics::{MetricsSnapshot, Registry};
use crate::pool::PoolSize;
use crate::scenario::Scenario;

/// How often abort-on-fail thresholds are re-evaluated while running.
const DEFAULT_THRESHOLD_TICK: Duration = Duration::from_secs(2);

/// Schedules scenarios, collects metrics, evaluates thresholds.
pub struct Runner {
    scenarios: Vec<Scenario>,
    thresholds: Vec<Threshold>,
    threshold_tick: Duration,
}

impl Runner {
    pub fn new() -> Self {
        Self {
            scenarios: Vec::new(),
            thresholds: Vec::new(),
            threshold_tick: DEFAULT_THRESHOLD_TICK,
        }
    }

    pub fn add_scenario(&mut self, scenario: Scenario) -> &mut Self {
        self.scenarios.push(scenario);
        self
    }

    pub fn add_threshold(&mut self, threshold: Threshold) -> &mut Self {
        self.thresholds.push(threshold);
        self
    }

    /// Override the periodic evaluation interval for abort-on-fail
    /// thresholds.
    pub fn threshold_tick(&mut self, tick: Duration) -> &mut Self {
        self.threshold_tick = tick;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.scenarios.is_empty() {
            return Err(Error::config("at least one scenario is required"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !seen.insert(scenario.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate scenario name `{}`",
                    scenario.name
                )));
            }
        }
        Ok(())
    }

    /// Run every scenario to a terminal state and summarize.
    ///
    /// Only [`Error::Config`] is returned; everything that happens after
    /// setup — iteration failures, timeouts, even a threshold abort — is
    /// recorded in the summary instead.
    pub async fn run(&self) -> Result<RunSummary, Error> {
        self.validate()?;

        let registry = Arc::new(Registry::new());
        let clock = RunClock::start();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        tracing::info!(scenarios = self.scenarios.len(), "run starting");
        let mut executors = JoinSet::new();
        for scenario in &self.scenarios {
            executors.spawn(drive_scenario(
                scenario.clone(),
                Arc::clone(&registry),
                clock,
                stop_rx.clone(),
            ));
        }

        let aborted_by = Arc::new(Mutex::new(None::<String>));
        let watchdog = self.spawn_watchdog(&registry, clock, &stop_tx, &aborted_by);

        let mut scenarios = BTreeMap::new();
        while let Some(joined) = executors.join_next().await {
            match joined {
                Ok((name, report)) => {
                    scenarios.insert(name, report);
                }
                Err(err) => tracing::error!(error = %err, "executor task panicked"),
            }
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let duration = clock.elapsed();
        let thresholds: Vec<ThresholdResult> = self
            .thresholds
            .iter()
            .map(|t| t.evaluate(&registry, duration))
            .collect();
        for result in thresholds.iter().filter(|r| !r.passed) {
            tracing::warn!(
                threshold = %result.metric,
                expression = %result.expression,
                observed = ?result.observed,
                "threshold failed"
            );
        }
        let passed = thresholds.iter().all(|r| r.passed);
        let aborted_by = aborted_by.lock().take();

        tracing::info!(?duration, passed, "run finished");
        Ok(RunSummary {
            duration,
            scenarios,
            metrics: registry.snapshot(duration),
            thresholds,
            aborted_by,
            passed,
        })
    }

    fn spawn_watchdog(
        &self,
        registry: &Arc<Registry>,
        clock: RunClock,
        stop_tx: &Arc<watch::Sender<bool>>,
        aborted_by: &Arc<Mutex<Option<String>>>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let aborting: Vec<Threshold> = self
            .thresholds
            .iter()
            .filter(|t| t.aborts())
            .cloned()
            .collect();
        if aborting.is_empty() {
            return None;
        }
        let registry = Arc::clone(registry);
        let stop_tx = Arc::clone(stop_tx);
        let aborted_by = Arc::clone(aborted_by);
        let tick = self.threshold_tick;
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                for threshold in &aborting {
                    let result = threshold.evaluate(&registry, clock.elapsed());
                    if !result.passed {
                        tracing::warn!(
                            error = %Error::ThresholdAbort(result.metric.clone()),
                            expression = %result.expression,
                            observed = ?result.observed,
                            "stopping the run"
                        );
                        *aborted_by.lock() = Some(result.metric.clone());
                        let _ = stop_tx.send(true);
                        return;
                    }
                }
            }
        }))
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait out the scenario's start offset, then drive its executor.
async fn drive_scenario(
    scenario: Scenario,
    registry: Arc<Registry>,
    clock: RunClock,
    stop: watch::Receiver<bool>,
) -> (String, ExecutorReport) {
    let name = scenario.name.clone();
    let kind = scenario.executor.kind();

    let mut stop_watch = stop.clone();
    tokio::select! {
        _ = tokio::time::sleep_until(clock.at(scenario.start_time)) => {}
        Ok(_) = stop_watch.wait_for(|s| *s) => {
            tracing::info!(scenario = %name, "run aborted before this scenario's start offset");
            return (
                name,
                ExecutorReport {
                    outcome: Outcome::Aborted,
                    started: 0,
                    completed: 0,
                    dropped: 0,
                    peak_vus: 0,
                },
            );
        }
    }

    let (pool_sizes, pool_rx) = watch::channel(PoolSize::default());
    observe_pool(name.clone(), pool_rx);

    tracing::info!(scenario = %name, kind, at = ?clock.elapsed(), "executor starting");
    let rcx = RunContext {
        scenario: Arc::new(ScenarioRuntime::new(&scenario)),
        registry,
        stop,
        pool_sizes,
    };
    let report = executor::build(&scenario.executor).run(rcx).await;
    tracing::info!(
        scenario = %name,
        outcome = ?report.outcome,
        completed = report.completed,
        dropped = report.dropped,
        peak_vus = report.peak_vus,
        "executor finished"
    );
    (name, report)
}

/// Capacity-planning diagnostics: log pool size changes as they happen.
fn observe_pool(scenario: String, mut sizes: watch::Receiver<PoolSize>) {
    tokio::spawn(async move {
        while sizes.changed().await.is_ok() {
            let size = *sizes.borrow();
            tracing::debug!(
                scenario = %scenario,
                live = size.live,
                leased = size.leased,
                "vu pool size changed"
            );
        }
    });
}

/// Everything the run produced, ready for a [`crate::report::Reporter`].
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub duration: Duration,
    pub scenarios: BTreeMap<String, ExecutorReport>,
    pub metrics: MetricsSnapshot,
    pub thresholds: Vec<ThresholdResult>,
    /// The selector of the abort-on-fail threshold that stopped the run,
    /// if any did.
    pub aborted_by: Option<String>,
    /// True iff every threshold passed.
    pub passed: bool,
}

impl RunSummary {
    /// The process-exit contract: 0 iff all thresholds passed.
    pub fn exit_code(&self) -> i32 {
        if self.passed { 0 } else { 1 }
    }
}
