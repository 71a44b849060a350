//! Reporters — where a finished [`RunSummary`] goes.
//!
//! The engine owns no on-disk format: [`RunSummary`] is `Serialize`, so any
//! serializer can consume it directly. For interactive use the built-in
//! [`StdoutReporter`] prints the familiar end-of-run block.

use std::fmt::Write as _;

use async_trait::async_trait;

use crate::metrics::SummaryValues;
use crate::runner::RunSummary;
use crate::scenario::BoxError;

/// Consumes the end-of-run summary and sends it somewhere: stdout, a file,
/// a time-series database.
#[async_trait]
pub trait Reporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), BoxError>;
}

/// Prints the summary as a text block.
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), BoxError> {
        println!("{}", render(summary));
        Ok(())
    }
}

/// The text form [`StdoutReporter`] prints.
pub fn render(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "run {} in {:.1}s",
        if summary.passed { "passed" } else { "failed" },
        summary.duration.as_secs_f64()
    );
    if let Some(threshold) = &summary.aborted_by {
        let _ = writeln!(out, "aborted by threshold: {threshold}");
    }

    let _ = writeln!(out, "\nscenarios:");
    for (name, report) in &summary.scenarios {
        let _ = writeln!(
            out,
            "  {name}: {:?}, {} iterations ({} dropped), peak {} vus",
            report.outcome, report.completed, report.dropped, report.peak_vus
        );
    }

    let _ = writeln!(out, "\nmetrics:");
    for (name, metric) in &summary.metrics.metrics {
        let _ = writeln!(out, "  {name}: {}", render_values(&metric.overall));
    }

    if !summary.thresholds.is_empty() {
        let _ = writeln!(out, "\nthresholds:");
        for result in &summary.thresholds {
            let mark = if result.passed { "ok" } else { "FAILED" };
            let observed = result
                .observed
                .map(|v| format!("{v:.2}"))
                .unwrap_or_else(|| "no samples".to_owned());
            let _ = writeln!(
                out,
                "  [{mark}] {} {} (observed {observed})",
                result.metric, result.expression
            );
        }
    }
    out
}

fn render_values(values: &SummaryValues) -> String {
    match values {
        SummaryValues::Counter { count, rate } => {
            format!("count={count} rate={rate:.2}/s")
        }
        SummaryValues::Rate { rate, passes, fails } => {
            format!("rate={:.2}% ({passes} of {})", rate * 100.0, passes + fails)
        }
        SummaryValues::Trend {
            avg,
            min,
            med,
            max,
            p90,
            p95,
            p99,
            count,
        } => format!(
            "avg={avg:.2} min={min} med={med} max={max} p(90)={p90} p(95)={p95} p(99)={p99} n={count}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::metrics::threshold::Threshold;
    use crate::runner::Runner;
    use crate::scenario::{Action, ExecutorConfig, Scenario};

    #[tokio::test(start_paused = true)]
    async fn renders_the_summary_block() {
        let mut runner = Runner::new();
        runner
            .add_scenario(
                Scenario::builder()
                    .name("smoke")
                    .action(Action::new(|_cx| async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    }))
                    .executor(ExecutorConfig::PerVuIterations {
                        vus: 1,
                        iterations: 3,
                        max_duration: None,
                    })
                    .build(),
            )
            .add_threshold(Threshold::new("iteration_failed", "rate<0.1").expect("valid"));
        let summary = runner.run().await.expect("valid run");

        let text = render(&summary);
        assert!(text.contains("run passed"));
        assert!(text.contains("smoke"));
        assert!(text.contains("iteration_duration"));
        assert!(text.contains("[ok] iteration_failed rate<0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn summary_serializes_to_json() {
        let mut runner = Runner::new();
        runner.add_scenario(
            Scenario::builder()
                .name("smoke")
                .action(Action::new(|_cx| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                }))
                .executor(ExecutorConfig::PerVuIterations {
                    vus: 1,
                    iterations: 2,
                    max_duration: None,
                })
                .build(),
        );
        let summary = runner.run().await.expect("valid run");
        let json = serde_json::to_value(&summary).expect("serializable");
        assert_eq!(json["passed"], serde_json::json!(true));
        assert!(json["metrics"]["iterations"]["overall"]["count"].is_number());
    }
}
