//! Threshold declarations and their evaluation.
//!
//! A threshold pairs a metric selector (`iteration_duration`,
//! `iteration_duration{scenario:checkout}`) with a boolean expression over
//! one aggregator of that metric (`p(95)<500`, `rate<0.1`, `count>=1000`).
//! Selectors with tags resolve to the merge of every series whose tag set
//! is a superset of the filter, so scenario-scoped thresholds work against
//! the same registry as global ones.
//!
//! Thresholds marked abort-on-fail are additionally evaluated on a periodic
//! tick while the run is live; the first failure aborts the remaining
//! executors.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::{MetricValue, Registry, Tags};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn eval(self, observed: f64, bound: f64) -> bool {
        match self {
            Op::Lt => observed < bound,
            Op::Le => observed <= bound,
            Op::Gt => observed > bound,
            Op::Ge => observed >= bound,
            Op::Eq => observed == bound,
            Op::Ne => observed != bound,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
            Op::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Aggregator {
    /// Counter sum.
    Count,
    /// Counter per-second rate, or Rate pass fraction.
    Rate,
    Avg,
    Min,
    Med,
    Max,
    Percentile(f64),
}

impl Aggregator {
    fn parse(token: &str) -> Result<Self, Error> {
        match token {
            "count" => Ok(Aggregator::Count),
            "rate" => Ok(Aggregator::Rate),
            "avg" => Ok(Aggregator::Avg),
            "min" => Ok(Aggregator::Min),
            "med" => Ok(Aggregator::Med),
            "max" => Ok(Aggregator::Max),
            _ => {
                let inner = token
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| Error::config(format!("unknown aggregator `{token}`")))?;
                let pct: f64 = inner
                    .parse()
                    .map_err(|_| Error::config(format!("bad percentile `{token}`")))?;
                if !(pct > 0.0 && pct <= 100.0) {
                    return Err(Error::config(format!(
                        "percentile out of range (0, 100]: `{token}`"
                    )));
                }
                Ok(Aggregator::Percentile(pct))
            }
        }
    }

    /// Resolve against an aggregated value. `None` means the aggregator
    /// does not apply to the value's kind.
    fn resolve(&self, value: &MetricValue, elapsed: Duration) -> Option<f64> {
        match (self, value) {
            (Aggregator::Count, MetricValue::Counter { sum }) => Some(*sum),
            (Aggregator::Rate, MetricValue::Counter { sum }) => {
                let secs = elapsed.as_secs_f64();
                Some(if secs > 0.0 { sum / secs } else { 0.0 })
            }
            (Aggregator::Rate, MetricValue::Rate { passes, total }) => Some(if *total > 0 {
                *passes as f64 / *total as f64
            } else {
                0.0
            }),
            (Aggregator::Avg, MetricValue::Trend { hist }) => Some(hist.mean()),
            (Aggregator::Min, MetricValue::Trend { hist }) => Some(hist.min() as f64),
            (Aggregator::Med, MetricValue::Trend { hist }) => {
                Some(hist.value_at_quantile(0.5) as f64)
            }
            (Aggregator::Max, MetricValue::Trend { hist }) => Some(hist.max() as f64),
            (Aggregator::Percentile(pct), MetricValue::Trend { hist }) => {
                Some(hist.value_at_quantile(pct / 100.0) as f64)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregator::Count => write!(f, "count"),
            Aggregator::Rate => write!(f, "rate"),
            Aggregator::Avg => write!(f, "avg"),
            Aggregator::Min => write!(f, "min"),
            Aggregator::Med => write!(f, "med"),
            Aggregator::Max => write!(f, "max"),
            Aggregator::Percentile(pct) => write!(f, "p({pct})"),
        }
    }
}

/// A parsed `<aggregator> <op> <number>` expression.
#[derive(Debug, Clone, PartialEq)]
struct Expression {
    aggregator: Aggregator,
    op: Op,
    bound: f64,
}

impl Expression {
    fn parse(raw: &str) -> Result<Self, Error> {
        let raw = raw.trim();
        let (idx, op) = [
            ("<=", Op::Le),
            (">=", Op::Ge),
            ("==", Op::Eq),
            ("!=", Op::Ne),
            ("<", Op::Lt),
            (">", Op::Gt),
        ]
        .iter()
        .filter_map(|(sym, op)| raw.find(sym).map(|i| (i, sym.len(), *op)))
        .min_by_key(|(i, len, _)| (*i, usize::MAX - len))
        .map(|(i, len, op)| ((i, i + len), op))
        .ok_or_else(|| Error::config(format!("no comparison operator in `{raw}`")))?;

        let aggregator = Aggregator::parse(raw[..idx.0].trim())?;
        let bound: f64 = raw[idx.1..]
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("bad numeric bound in `{raw}`")))?;
        if !bound.is_finite() {
            return Err(Error::config(format!("non-finite bound in `{raw}`")));
        }
        Ok(Self {
            aggregator,
            op,
            bound,
        })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregator, self.op.as_str(), self.bound)
    }
}

/// A pass/fail declaration over one aggregated metric.
#[derive(Debug, Clone)]
pub struct Threshold {
    metric: String,
    tags: Tags,
    expression: Expression,
    abort_on_fail: bool,
}

impl Threshold {
    /// Parse a selector (`name` or `name{tag:value,...}`) and an
    /// expression. Malformed input is [`Error::Config`].
    pub fn new(selector: &str, expression: &str) -> Result<Self, Error> {
        let selector = selector.trim();
        let (metric, tags) = match selector.split_once('{') {
            None => (selector, Tags::new()),
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix('}')
                    .ok_or_else(|| Error::config(format!("unclosed tag filter in `{selector}`")))?;
                let mut tags = Tags::new();
                for pair in inner.split(',') {
                    let (k, v) = pair
                        .split_once(':')
                        .ok_or_else(|| Error::config(format!("bad tag pair `{pair}`")))?;
                    if k.trim().is_empty() || v.trim().is_empty() {
                        return Err(Error::config(format!("empty tag pair in `{selector}`")));
                    }
                    tags.insert(k.trim().to_owned(), v.trim().to_owned());
                }
                (name, tags)
            }
        };
        if metric.is_empty() {
            return Err(Error::config("empty metric name in threshold selector"));
        }
        Ok(Self {
            metric: metric.to_owned(),
            tags,
            expression: Expression::parse(expression)?,
            abort_on_fail: false,
        })
    }

    /// Abort the whole run as soon as a periodic evaluation fails this
    /// threshold, instead of only failing it in the final summary.
    pub fn abort_on_fail(mut self) -> Self {
        self.abort_on_fail = true;
        self
    }

    pub(crate) fn aborts(&self) -> bool {
        self.abort_on_fail
    }

    /// The display form of the selector, e.g. `latency{scenario:api}`.
    pub fn selector(&self) -> String {
        if self.tags.is_empty() {
            self.metric.clone()
        } else {
            let inner: Vec<String> = self
                .tags
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect();
            format!("{}{{{}}}", self.metric, inner.join(","))
        }
    }

    pub(crate) fn evaluate(&self, registry: &Registry, elapsed: Duration) -> ThresholdResult {
        let (passed, observed) = match registry.merged(&self.metric, &self.tags) {
            None => {
                tracing::warn!(
                    threshold = %self.selector(),
                    "no samples matched the threshold selector; passing vacuously"
                );
                (true, None)
            }
            Some(value) => match self.expression.aggregator.resolve(&value, elapsed) {
                Some(observed) => (self.expression.op.eval(observed, self.expression.bound), Some(observed)),
                None => {
                    tracing::warn!(
                        threshold = %self.selector(),
                        kind = ?value.kind(),
                        "aggregator does not apply to this metric kind; failing threshold"
                    );
                    (false, None)
                }
            },
        };
        ThresholdResult {
            metric: self.selector(),
            expression: self.expression.to_string(),
            passed,
            observed,
        }
    }
}

/// Outcome of one threshold evaluation, as it appears in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    pub observed: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ITERATION_FAILED;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_the_reference_expression_shapes() {
        for expr in [
            "p(95)<1000",
            "p(99.9)<=2000",
            "rate<0.1",
            "rate>0.95",
            "count<10",
            "avg>=12.5",
            "med!=0",
            "max==3",
        ] {
            Threshold::new("m", expr).expect(expr);
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["p95<1000", "p(101)<1", "p(0)<1", "rate", "rate<abc", "wat<1"] {
            assert!(Threshold::new("m", expr).is_err(), "accepted `{expr}`");
        }
        assert!(Threshold::new("", "rate<0.1").is_err());
        assert!(Threshold::new("m{scenario:a", "rate<0.1").is_err());
        assert!(Threshold::new("m{scenario}", "rate<0.1").is_err());
    }

    #[test]
    fn selector_round_trips() {
        let t = Threshold::new("latency{scenario:api,group:x}", "p(95)<500").expect("valid");
        assert_eq!(t.selector(), "latency{group:x,scenario:api}");
        let t = Threshold::new("latency", "p(95)<500").expect("valid");
        assert_eq!(t.selector(), "latency");
    }

    #[test]
    fn percentile_thresholds_evaluate_deterministically() {
        let reg = Registry::new();
        let t = Tags::new();
        for v in 1..=100 {
            reg.add_trend("latency", v * 10, &t);
        }
        // p(95) of 10..=1000 in steps of 10 is 950
        let pass = Threshold::new("latency", "p(95)<1000").expect("valid");
        let fail = Threshold::new("latency", "p(95)<900").expect("valid");
        let elapsed = Duration::from_secs(1);
        assert!(pass.evaluate(&reg, elapsed).passed);
        let res = fail.evaluate(&reg, elapsed);
        assert!(!res.passed);
        assert_eq!(res.observed, Some(950.0));
    }

    #[test]
    fn rate_threshold_matches_failure_fraction() {
        let reg = Registry::new();
        let t = Tags::new();
        for i in 0..100 {
            reg.add_rate(ITERATION_FAILED, i < 5, &t);
        }
        let pass = Threshold::new(ITERATION_FAILED, "rate<0.1").expect("valid");
        let fail = Threshold::new(ITERATION_FAILED, "rate<0.04").expect("valid");
        let elapsed = Duration::from_secs(1);
        assert!(pass.evaluate(&reg, elapsed).passed);
        assert!(!fail.evaluate(&reg, elapsed).passed);
    }

    #[test]
    fn counter_rate_uses_run_duration_as_denominator() {
        let reg = Registry::new();
        reg.add_counter("hits", 300.0, &Tags::new());
        let t = Threshold::new("hits", "rate>=10").expect("valid");
        assert!(t.evaluate(&reg, Duration::from_secs(30)).passed);
        assert!(!t.evaluate(&reg, Duration::from_secs(60)).passed);
    }

    #[test]
    fn tag_scoped_threshold_sees_only_matching_series() {
        let reg = Registry::new();
        reg.add_trend("latency", 100, &tags(&[("scenario", "warm")]));
        reg.add_trend("latency", 5000, &tags(&[("scenario", "stress")]));
        let scoped = Threshold::new("latency{scenario:warm}", "p(95)<200").expect("valid");
        let global = Threshold::new("latency", "p(95)<200").expect("valid");
        let elapsed = Duration::from_secs(1);
        assert!(scoped.evaluate(&reg, elapsed).passed);
        assert!(!global.evaluate(&reg, elapsed).passed);
    }

    #[test]
    fn unmatched_selector_passes_vacuously() {
        let reg = Registry::new();
        let t = Threshold::new("never_recorded", "rate>0.95").expect("valid");
        let res = t.evaluate(&reg, Duration::from_secs(1));
        assert!(res.passed);
        assert_eq!(res.observed, None);
    }

    #[test]
    fn kind_mismatch_fails_the_threshold() {
        let reg = Registry::new();
        reg.add_counter("hits", 1.0, &Tags::new());
        let t = Threshold::new("hits", "p(95)<10").expect("valid");
        assert!(!t.evaluate(&reg, Duration::from_secs(1)).passed);
    }
}
