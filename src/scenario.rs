//! Scenario configuration — the declarative unit the runner schedules.
//!
//! A [`Scenario`] binds a name, an executor discipline, a start offset,
//! static tags, environment overrides, and the [`Action`] to execute. It is
//! immutable once the run starts; validation happens up front and any
//! violation is [`Error::Config`], raised before a single iteration runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use typed_builder::TypedBuilder;

use crate::error::Error;
use crate::executor::Stage;
use crate::metrics::{Registry, Tags};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What one execution of the user's traffic logic produced. An `Err` is
/// recorded as an `iteration_failed` sample; it never stops the run.
pub type IterationResult = Result<(), BoxError>;

/// The user-supplied iteration body. Cheap to clone; one `Action` is shared
/// by every VU of its scenario.
#[derive(Clone)]
pub struct Action(Arc<dyn Fn(IterContext) -> BoxFuture<'static, IterationResult> + Send + Sync>);

impl Action {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(IterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IterationResult> + Send + 'static,
    {
        Action(Arc::new(move |cx| Box::pin(f(cx))))
    }

    pub(crate) fn call(&self, cx: IterContext) -> BoxFuture<'static, IterationResult> {
        (self.0)(cx)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Action(..)")
    }
}

/// Per-iteration view handed to the action: identity, scenario tags,
/// environment overrides, and tagged access to the metric registry.
#[derive(Clone)]
pub struct IterContext {
    pub scenario: Arc<str>,
    pub vu: u32,
    pub iteration: u64,
    tags: Arc<Tags>,
    env: Arc<BTreeMap<String, String>>,
    registry: Arc<Registry>,
}

impl IterContext {
    pub(crate) fn new(
        scenario: Arc<str>,
        vu: u32,
        iteration: u64,
        tags: Arc<Tags>,
        env: Arc<BTreeMap<String, String>>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            scenario,
            vu,
            iteration,
            tags,
            env,
            registry,
        }
    }

    /// Scenario environment override, if declared.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// The tag set stamped on every sample this iteration emits.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// A context whose emitted samples carry one extra tag.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut tags = (*self.tags).clone();
        tags.insert(key.into(), value.into());
        Self {
            tags: Arc::new(tags),
            ..self.clone()
        }
    }

    /// Add to a custom counter metric.
    pub fn counter(&self, name: &str, value: f64) {
        self.registry.add_counter(name, value, &self.tags);
    }

    /// Record a boolean outcome into a custom rate metric.
    pub fn rate(&self, name: &str, hit: bool) {
        self.registry.add_rate(name, hit, &self.tags);
    }

    /// Record a sample into a custom trend metric.
    pub fn trend(&self, name: &str, value: u64) {
        self.registry.add_trend(name, value, &self.tags);
    }
}

/// Discipline-specific executor parameters.
///
/// `max_duration` on the iteration-counted disciplines defaults to ten
/// minutes when left unset.
#[derive(Debug, Clone)]
pub enum ExecutorConfig {
    /// N VUs cooperatively drain one shared iteration counter.
    SharedIterations {
        vus: usize,
        iterations: u64,
        max_duration: Option<Duration>,
    },
    /// Each of N VUs independently runs exactly K iterations.
    PerVuIterations {
        vus: usize,
        iterations: u64,
        max_duration: Option<Duration>,
    },
    /// N VUs loop back-to-back for the full duration.
    ConstantVus { vus: usize, duration: Duration },
    /// VU count follows the stage list by linear interpolation.
    RampingVus { start_vus: usize, stages: Vec<Stage> },
    /// Fixed iteration-start rate, decoupled from iteration duration.
    ConstantArrivalRate {
        /// Iteration starts per `time_unit`.
        rate: f64,
        time_unit: Duration,
        duration: Duration,
        pre_allocated_vus: usize,
        max_vus: usize,
    },
    /// Iteration-start rate follows the stage list by linear interpolation.
    RampingArrivalRate {
        /// Rate at time zero.
        start_rate: f64,
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_vus: usize,
        max_vus: usize,
    },
}

impl ExecutorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorConfig::SharedIterations { .. } => "shared-iterations",
            ExecutorConfig::PerVuIterations { .. } => "per-vu-iterations",
            ExecutorConfig::ConstantVus { .. } => "constant-vus",
            ExecutorConfig::RampingVus { .. } => "ramping-vus",
            ExecutorConfig::ConstantArrivalRate { .. } => "constant-arrival-rate",
            ExecutorConfig::RampingArrivalRate { .. } => "ramping-arrival-rate",
        }
    }

    fn validate(&self) -> Result<(), Error> {
        fn stages_ok(stages: &[Stage]) -> Result<(), Error> {
            if stages.is_empty() {
                return Err(Error::config("at least one stage is required"));
            }
            for stage in stages {
                if !(stage.target.is_finite() && stage.target >= 0.0) {
                    return Err(Error::config(format!(
                        "stage target must be a non-negative finite number, got {}",
                        stage.target
                    )));
                }
            }
            Ok(())
        }

        match self {
            ExecutorConfig::SharedIterations { vus, iterations, .. }
            | ExecutorConfig::PerVuIterations { vus, iterations, .. } => {
                if *vus == 0 {
                    return Err(Error::config("vus must be at least 1"));
                }
                if *iterations == 0 {
                    return Err(Error::config("iterations must be at least 1"));
                }
            }
            ExecutorConfig::ConstantVus { vus, duration } => {
                if *vus == 0 {
                    return Err(Error::config("vus must be at least 1"));
                }
                if duration.is_zero() {
                    return Err(Error::config("duration must be non-zero"));
                }
            }
            ExecutorConfig::RampingVus { stages, .. } => stages_ok(stages)?,
            ExecutorConfig::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => {
                if !(rate.is_finite() && *rate > 0.0) {
                    return Err(Error::config("rate must be a positive finite number"));
                }
                if time_unit.is_zero() {
                    return Err(Error::config("time_unit must be non-zero"));
                }
                if duration.is_zero() {
                    return Err(Error::config("duration must be non-zero"));
                }
                check_vu_bounds(*pre_allocated_vus, *max_vus)?;
            }
            ExecutorConfig::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                pre_allocated_vus,
                max_vus,
            } => {
                if !(start_rate.is_finite() && *start_rate >= 0.0) {
                    return Err(Error::config(
                        "start_rate must be a non-negative finite number",
                    ));
                }
                if time_unit.is_zero() {
                    return Err(Error::config("time_unit must be non-zero"));
                }
                stages_ok(stages)?;
                check_vu_bounds(*pre_allocated_vus, *max_vus)?;
            }
        }
        Ok(())
    }
}

fn check_vu_bounds(pre_allocated: usize, max: usize) -> Result<(), Error> {
    if max == 0 {
        return Err(Error::config("max_vus must be at least 1"));
    }
    if pre_allocated > max {
        return Err(Error::config(format!(
            "pre_allocated_vus ({pre_allocated}) must not exceed max_vus ({max})"
        )));
    }
    Ok(())
}

/// One named traffic-generation scenario.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub action: Action,
    pub executor: ExecutorConfig,
    /// Offset from run start at which this scenario's executor begins.
    #[builder(default)]
    pub start_time: Duration,
    /// Static tags stamped on every sample the scenario emits, alongside
    /// the implicit `scenario` tag.
    #[builder(default)]
    pub tags: Tags,
    /// Environment overrides visible to the action via [`IterContext::env`].
    #[builder(default)]
    pub env: BTreeMap<String, String>,
}

impl Scenario {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::config("scenario name must not be empty"));
        }
        self.executor
            .validate()
            .map_err(|e| Error::config(format!("scenario `{}`: {e}", self.name)))
    }

    /// The full tag set for this scenario's samples.
    pub(crate) fn sample_tags(&self) -> Tags {
        let mut tags = self.tags.clone();
        tags.insert("scenario".to_owned(), self.name.clone());
        tags
    }
}
