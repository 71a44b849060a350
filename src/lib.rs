//! Bora — a programmable load-generation engine for Rust.
//!
//! Bora borrows its scenario model from tools such as k6, Goose and RLT:
//! you declare named scenarios, each driven by one of six scheduling
//! disciplines, and the engine takes care of pacing, VU pools, metric
//! collection and pass/fail thresholds. The iteration body itself is an
//! async closure you supply — HTTP, gRPC, or anything else you can await.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: configuration object binding a name, an executor
//!   discipline, a start offset, tags, env overrides and an [`Action`].
//! - Executors: the scheduling disciplines. Count-based
//!   (`shared-iterations`, `per-vu-iterations`, `constant-vus`,
//!   `ramping-vus`) fix concurrency; arrival-rate based
//!   (`constant-arrival-rate`, `ramping-arrival-rate`) fix the
//!   iteration-start rate and flex the VU pool to keep up.
//! - [`Registry`](metrics::Registry): thread-safe Counter / Rate / Trend
//!   accumulation, tagged per scenario so thresholds can be scoped.
//! - [`Threshold`]: a pass/fail expression over an aggregated metric, such
//!   as `p(95)<500` or `rate<0.1`, optionally aborting the run on failure.
//! - [`Runner`]: the scheduler. Starts every scenario at its offset, runs
//!   them concurrently, and produces a [`RunSummary`].
//! - [`Reporter`]: consumes the summary and sends it somewhere.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use bora::{Action, ExecutorConfig, Runner, Scenario, Threshold};
//! use bora::report::{Reporter, StdoutReporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut runner = Runner::new();
//!     runner
//!         .add_scenario(
//!             Scenario::builder()
//!                 .name("steady")
//!                 .action(Action::new(|cx| async move {
//!                     // Issue one request with your favourite client here.
//!                     tokio::time::sleep(Duration::from_millis(5)).await;
//!                     cx.rate("checks", true);
//!                     Ok(())
//!                 }))
//!                 .executor(ExecutorConfig::ConstantVus {
//!                     vus: 8,
//!                     duration: Duration::from_secs(30),
//!                 })
//!                 .build(),
//!         )
//!         .add_threshold(Threshold::new("iteration_duration", "p(95)<500")?)
//!         .add_threshold(Threshold::new("iteration_failed", "rate<0.1")?);
//!
//!     let summary = runner.run().await?;
//!     StdoutReporter.report(&summary).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```
//!
//! # Design notes
//!
//! - Cancellation is cooperative everywhere: the stop signal, duration
//!   caps and VU retirement are checked only at iteration and tick
//!   boundaries, so an in-flight iteration always finishes and a hung one
//!   delays termination without corrupting state.
//! - Per-iteration failures never stop the run; they become
//!   `iteration_failed` samples. Only invalid configuration (before the
//!   run) and abort-on-fail thresholds (during it) end a run early, and
//!   even an aborted run produces a full summary.
//! - The whole engine schedules against [`tokio::time::Instant`], so every
//!   timing property is testable under `start_paused` without wall-clock
//!   flakiness.

/// Run-anchored monotonic time.
pub mod clock;
/// The engine's error taxonomy.
pub mod error;
/// The six scheduling disciplines and their shared stage math.
pub mod executor;
/// Counter / Rate / Trend registry and threshold evaluation.
pub mod metrics;
/// The bounded, reusable virtual-user pool.
pub mod pool;
/// Reporters that consume the final summary.
pub mod report;
/// The scenario scheduler that owns a run end to end.
pub mod runner;
/// Scenario configuration and the iteration-body seam.
pub mod scenario;

pub use error::Error;
pub use executor::{ExecutorReport, Outcome, Stage};
pub use metrics::threshold::{Threshold, ThresholdResult};
pub use metrics::{MetricKind, Registry, Tags};
pub use report::{Reporter, StdoutReporter};
pub use runner::{RunSummary, Runner};
pub use scenario::{Action, ExecutorConfig, IterContext, IterationResult, Scenario};
