//! Executors — the scheduling disciplines that decide when iterations
//! start.
//!
//! Six disciplines are provided, in two families. The count-based family
//! (`shared-iterations`, `per-vu-iterations`, `constant-vus`,
//! `ramping-vus`) fixes how many VUs loop and lets throughput follow
//! iteration duration. The arrival-rate family (`constant-arrival-rate`,
//! `ramping-arrival-rate`) fixes the iteration-start rate and flexes the VU
//! pool to keep up, dropping starts (counted, non-fatal) when it cannot.
//!
//! All disciplines share the same shape: lease VUs from the scenario's
//! pool, run iterations through [`run_iteration`], and wind down
//! cooperatively — cancellation is checked only at iteration and tick
//! boundaries, so an in-flight iteration always finishes.

pub mod stage;

pub(crate) mod iterations;
pub(crate) mod rate;
pub(crate) mod vus;

pub use stage::Stage;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::metrics::{
    DROPPED_ITERATIONS, ITERATION_DURATION, ITERATION_FAILED, ITERATIONS, Registry, Tags,
};
use crate::pool::PoolSize;
use crate::scenario::{Action, ExecutorConfig, IterContext, Scenario};

/// Default cap for the iteration-counted disciplines when the scenario
/// does not set one.
pub(crate) const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);

/// Granularity of arrival governors and ramp re-planning.
pub(crate) const TICK: Duration = Duration::from_millis(100);

/// Terminal state of one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// All intended work finished.
    Completed,
    /// The duration cap elapsed with work remaining.
    TimedOut,
    /// The scheduler's stop signal ended the executor early.
    Aborted,
}

/// What an executor reports back to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorReport {
    pub outcome: Outcome,
    /// Iteration starts attempted (arrival events or counter claims).
    pub started: u64,
    /// Iterations that ran to completion.
    pub completed: u64,
    /// Arrival events skipped because no VU was available.
    pub dropped: u64,
    /// Highest number of simultaneously busy VUs.
    pub peak_vus: usize,
}

/// Immutable per-scenario state shared by every worker task.
pub(crate) struct ScenarioRuntime {
    pub name: Arc<str>,
    pub action: Action,
    /// Static tags plus the implicit `scenario` tag.
    pub tags: Arc<Tags>,
    pub env: Arc<BTreeMap<String, String>>,
}

impl ScenarioRuntime {
    pub fn new(scenario: &Scenario) -> Self {
        Self {
            name: Arc::from(scenario.name.as_str()),
            action: scenario.action.clone(),
            tags: Arc::new(scenario.sample_tags()),
            env: Arc::new(scenario.env.clone()),
        }
    }
}

/// Everything an executor needs from the scheduler.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub scenario: Arc<ScenarioRuntime>,
    pub registry: Arc<Registry>,
    /// Flips once when the run aborts; checked at iteration boundaries.
    pub stop: watch::Receiver<bool>,
    /// Pool size diagnostics, forwarded to the scheduler.
    pub pool_sizes: watch::Sender<PoolSize>,
}

impl RunContext {
    pub fn stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Run one iteration on a leased VU and record the built-in metrics.
pub(crate) async fn run_iteration(vu: &mut crate::pool::Vu, rcx: &RunContext) {
    let scenario = &rcx.scenario;
    let cx = IterContext::new(
        Arc::clone(&scenario.name),
        vu.id,
        vu.iterations,
        Arc::clone(&scenario.tags),
        Arc::clone(&scenario.env),
        Arc::clone(&rcx.registry),
    );
    let started = Instant::now();
    let result = scenario.action.call(cx).await;
    let elapsed = started.elapsed();

    let tags = &*scenario.tags;
    rcx.registry
        .add_trend(ITERATION_DURATION, elapsed.as_millis() as u64, tags);
    rcx.registry.add_counter(ITERATIONS, 1.0, tags);
    rcx.registry.add_rate(ITERATION_FAILED, result.is_err(), tags);
    if let Err(err) = result {
        tracing::debug!(
            scenario = %scenario.name,
            vu = vu.id,
            iteration = vu.iterations,
            error = %err,
            "iteration failed"
        );
    }
    vu.iterations += 1;
}

/// Count one dropped arrival event.
pub(crate) fn record_drop(rcx: &RunContext) {
    rcx.registry
        .add_counter(DROPPED_ITERATIONS, 1.0, &rcx.scenario.tags);
}

/// One scheduling discipline driving one scenario to a terminal state.
#[async_trait]
pub(crate) trait Executor: Send + Sync {
    async fn run(&self, rcx: RunContext) -> ExecutorReport;
}

/// Instantiate the discipline for a validated config.
pub(crate) fn build(config: &ExecutorConfig) -> Box<dyn Executor> {
    match config.clone() {
        ExecutorConfig::SharedIterations {
            vus,
            iterations,
            max_duration,
        } => Box::new(iterations::SharedIterations {
            vus,
            iterations,
            max_duration: max_duration.unwrap_or(DEFAULT_MAX_DURATION),
        }),
        ExecutorConfig::PerVuIterations {
            vus,
            iterations,
            max_duration,
        } => Box::new(iterations::PerVuIterations {
            vus,
            iterations,
            max_duration: max_duration.unwrap_or(DEFAULT_MAX_DURATION),
        }),
        ExecutorConfig::ConstantVus { vus, duration } => {
            Box::new(vus::ConstantVus { vus, duration })
        }
        ExecutorConfig::RampingVus { start_vus, stages } => {
            Box::new(vus::RampingVus { start_vus, stages })
        }
        ExecutorConfig::ConstantArrivalRate {
            rate,
            time_unit,
            duration,
            pre_allocated_vus,
            max_vus,
        } => {
            // A constant rate is one zero-duration jump plus one hold stage.
            let per_sec = rate / time_unit.as_secs_f64();
            Box::new(rate::ArrivalRate {
                stages: vec![Stage::new(Duration::ZERO, per_sec), Stage::new(duration, per_sec)],
                pre_allocated_vus,
                max_vus,
            })
        }
        ExecutorConfig::RampingArrivalRate {
            start_rate,
            time_unit,
            stages,
            pre_allocated_vus,
            max_vus,
        } => {
            let unit = time_unit.as_secs_f64();
            let mut per_sec = Vec::with_capacity(stages.len() + 1);
            per_sec.push(Stage::new(Duration::ZERO, start_rate / unit));
            per_sec.extend(
                stages
                    .iter()
                    .map(|s| Stage::new(s.duration, s.target / unit)),
            );
            Box::new(rate::ArrivalRate {
                stages: per_sec,
                pre_allocated_vus,
                max_vus,
            })
        }
    }
}
