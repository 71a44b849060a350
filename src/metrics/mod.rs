//! Metric registry — thread-safe accumulation of Counter, Rate and Trend
//! samples, keyed by metric name and tag set.
//!
//! The registry is the only state mutated by every worker concurrently, so
//! the locking discipline is deliberately fine-grained: the family map is a
//! [`DashMap`] (sharded), and each family guards its per-tag-set series with
//! its own [`parking_lot::Mutex`] held only for the point update. No lock is
//! ever held across an iteration body.
//!
//! Aggregation is associative and commutative: counters sum, rates keep
//! pass/total counts, trends keep an [`hdrhistogram`] histogram, and
//! same-kind values merge in any order. That is what allows tag-filtered
//! sub-metrics to be materialized late, by merging matching series at
//! threshold-evaluation time.

pub mod threshold;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

/// Tag sets are ordered maps so they hash and compare structurally.
pub type Tags = BTreeMap<String, String>;

/// Completed iterations, per scenario. Counter.
pub const ITERATIONS: &str = "iterations";
/// Wall time of one iteration body, in milliseconds. Trend.
pub const ITERATION_DURATION: &str = "iteration_duration";
/// Whether an iteration body returned an error. Rate (true = failed).
pub const ITERATION_FAILED: &str = "iteration_failed";
/// Arrival-rate start events skipped because no VU was available. Counter.
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";

/// The three aggregation kinds a metric family can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

/// Aggregated state for one (metric, tag set) series.
#[derive(Clone)]
pub(crate) enum MetricValue {
    Counter { sum: f64 },
    Rate { passes: u64, total: u64 },
    Trend { hist: Histogram<u64> },
}

impl fmt::Debug for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Counter { sum } => write!(f, "Counter({sum})"),
            MetricValue::Rate { passes, total } => write!(f, "Rate({passes}/{total})"),
            MetricValue::Trend { hist } => write!(f, "Trend(n={})", hist.len()),
        }
    }
}

impl MetricValue {
    fn zero(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricValue::Counter { sum: 0.0 },
            MetricKind::Rate => MetricValue::Rate { passes: 0, total: 0 },
            MetricKind::Trend => MetricValue::Trend {
                hist: Histogram::new(3).expect("3 significant digits is a valid histogram config"),
            },
        }
    }

    pub(crate) fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter { .. } => MetricKind::Counter,
            MetricValue::Rate { .. } => MetricKind::Rate,
            MetricValue::Trend { .. } => MetricKind::Trend,
        }
    }

    /// Fold `other` into `self`. Both sides must be the same kind.
    pub(crate) fn merge(&mut self, other: &MetricValue) {
        match (self, other) {
            (MetricValue::Counter { sum }, MetricValue::Counter { sum: o }) => *sum += o,
            (
                MetricValue::Rate { passes, total },
                MetricValue::Rate {
                    passes: op,
                    total: ot,
                },
            ) => {
                *passes += op;
                *total += ot;
            }
            (MetricValue::Trend { hist }, MetricValue::Trend { hist: o }) => {
                hist.add(o).expect("histograms are auto-resizing");
            }
            _ => unreachable!("series of one family share a kind"),
        }
    }
}

struct Family {
    kind: MetricKind,
    series: Mutex<HashMap<Tags, MetricValue>>,
}

impl Family {
    fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            series: Mutex::new(HashMap::new()),
        }
    }
}

/// Process-wide metric store for one run. Created by the runner at run
/// start and torn down only after the summary has been built from it.
pub struct Registry {
    families: DashMap<String, Family>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            families: DashMap::new(),
        }
    }

    /// Add `value` to a counter series.
    pub fn add_counter(&self, name: &str, value: f64, tags: &Tags) {
        self.record(name, MetricKind::Counter, tags, |v| {
            if let MetricValue::Counter { sum } = v {
                *sum += value;
            }
        });
    }

    /// Record one boolean outcome into a rate series.
    pub fn add_rate(&self, name: &str, hit: bool, tags: &Tags) {
        self.record(name, MetricKind::Rate, tags, |v| {
            if let MetricValue::Rate { passes, total } = v {
                *passes += hit as u64;
                *total += 1;
            }
        });
    }

    /// Record one sample into a trend series. The unit is whatever the
    /// caller consistently uses; the engine's built-in
    /// [`ITERATION_DURATION`] records milliseconds.
    pub fn add_trend(&self, name: &str, value: u64, tags: &Tags) {
        self.record(name, MetricKind::Trend, tags, |v| {
            if let MetricValue::Trend { hist } = v {
                hist.saturating_record(value);
            }
        });
    }

    fn record(&self, name: &str, kind: MetricKind, tags: &Tags, apply: impl FnOnce(&mut MetricValue)) {
        if self.families.get(name).is_none() {
            self.families
                .entry(name.to_owned())
                .or_insert_with(|| Family::new(kind));
        }
        let family = self
            .families
            .get(name)
            .expect("family inserted immediately above");
        if family.kind != kind {
            tracing::warn!(
                metric = name,
                expected = ?family.kind,
                got = ?kind,
                "dropping sample recorded with mismatched metric kind"
            );
            return;
        }
        let mut series = family.series.lock();
        match series.get_mut(tags) {
            Some(value) => apply(value),
            None => {
                let value = series
                    .entry(tags.clone())
                    .or_insert_with(|| MetricValue::zero(kind));
                apply(value);
            }
        }
    }

    /// Merge every series of `name` whose tags are a superset of `filter`
    /// into one value. `None` when the family does not exist or nothing
    /// matches.
    pub(crate) fn merged(&self, name: &str, filter: &Tags) -> Option<MetricValue> {
        let family = self.families.get(name)?;
        let series = family.series.lock();
        let mut out: Option<MetricValue> = None;
        for (tags, value) in series.iter() {
            if filter.iter().all(|(k, v)| tags.get(k) == Some(v)) {
                match &mut out {
                    Some(acc) => acc.merge(value),
                    None => out = Some(value.clone()),
                }
            }
        }
        out
    }

    /// Snapshot the whole registry into serializable summaries. `elapsed`
    /// is the run duration, used for counter per-second rates.
    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let mut metrics = BTreeMap::new();
        for entry in self.families.iter() {
            let series = entry.series.lock();
            let mut overall: Option<MetricValue> = None;
            let mut per_series = Vec::with_capacity(series.len());
            for (tags, value) in series.iter() {
                match &mut overall {
                    Some(acc) => acc.merge(value),
                    None => overall = Some(value.clone()),
                }
                per_series.push(SeriesReport {
                    tags: tags.clone(),
                    values: SummaryValues::from_value(value, elapsed),
                });
            }
            let Some(overall) = overall else { continue };
            per_series.sort_by(|a, b| a.tags.cmp(&b.tags));
            metrics.insert(
                entry.key().clone(),
                MetricReport {
                    kind: entry.kind,
                    overall: SummaryValues::from_value(&overall, elapsed),
                    series: per_series,
                },
            );
        }
        MetricsSnapshot { metrics }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Full end-of-run view of the registry, ready for serialization.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: BTreeMap<String, MetricReport>,
}

/// One metric family: the all-series rollup plus each tagged series.
#[derive(Debug, Serialize)]
pub struct MetricReport {
    pub kind: MetricKind,
    pub overall: SummaryValues,
    pub series: Vec<SeriesReport>,
}

#[derive(Debug, Serialize)]
pub struct SeriesReport {
    pub tags: Tags,
    pub values: SummaryValues,
}

/// Derived statistics for one aggregated value.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SummaryValues {
    Counter {
        count: f64,
        /// Per-second rate over the run duration.
        rate: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        avg: f64,
        min: u64,
        med: u64,
        max: u64,
        p90: u64,
        p95: u64,
        p99: u64,
        count: u64,
    },
}

impl SummaryValues {
    fn from_value(value: &MetricValue, elapsed: Duration) -> Self {
        match value {
            MetricValue::Counter { sum } => {
                let secs = elapsed.as_secs_f64();
                SummaryValues::Counter {
                    count: *sum,
                    rate: if secs > 0.0 { sum / secs } else { 0.0 },
                }
            }
            MetricValue::Rate { passes, total } => SummaryValues::Rate {
                rate: if *total > 0 {
                    *passes as f64 / *total as f64
                } else {
                    0.0
                },
                passes: *passes,
                fails: total - passes,
            },
            MetricValue::Trend { hist } => SummaryValues::Trend {
                avg: hist.mean(),
                min: hist.min(),
                med: hist.value_at_quantile(0.5),
                max: hist.max(),
                p90: hist.value_at_quantile(0.90),
                p95: hist.value_at_quantile(0.95),
                p99: hist.value_at_quantile(0.99),
                count: hist.len(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn counters_sum_per_tag_set() {
        let reg = Registry::new();
        let a = tags(&[("scenario", "a")]);
        let b = tags(&[("scenario", "b")]);
        reg.add_counter(ITERATIONS, 1.0, &a);
        reg.add_counter(ITERATIONS, 1.0, &a);
        reg.add_counter(ITERATIONS, 5.0, &b);

        match reg.merged(ITERATIONS, &a) {
            Some(MetricValue::Counter { sum }) => assert_eq!(sum, 2.0),
            other => panic!("unexpected: {other:?}"),
        }
        match reg.merged(ITERATIONS, &Tags::new()) {
            Some(MetricValue::Counter { sum }) => assert_eq!(sum, 7.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rates_track_pass_fraction() {
        let reg = Registry::new();
        let t = tags(&[("scenario", "s")]);
        for i in 0..10 {
            reg.add_rate(ITERATION_FAILED, i < 3, &t);
        }
        match reg.merged(ITERATION_FAILED, &Tags::new()) {
            Some(MetricValue::Rate { passes, total }) => {
                assert_eq!(passes, 3);
                assert_eq!(total, 10);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn trend_percentiles_are_deterministic() {
        let reg = Registry::new();
        let t = Tags::new();
        for v in 1..=100 {
            reg.add_trend(ITERATION_DURATION, v, &t);
        }
        let snap = reg.snapshot(Duration::from_secs(10));
        let report = &snap.metrics[ITERATION_DURATION];
        match &report.overall {
            SummaryValues::Trend { med, p95, max, count, .. } => {
                assert_eq!(*count, 100);
                assert_eq!(*max, 100);
                assert_eq!(*med, 50);
                assert_eq!(*p95, 95);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tag_filter_merges_matching_series_only() {
        let reg = Registry::new();
        let warm = tags(&[("scenario", "warmup"), ("group", "x")]);
        let api = tags(&[("scenario", "api"), ("group", "x")]);
        reg.add_trend("latency", 10, &warm);
        reg.add_trend("latency", 1000, &api);

        match reg.merged("latency", &tags(&[("scenario", "warmup")])) {
            Some(MetricValue::Trend { hist }) => {
                assert_eq!(hist.len(), 1);
                assert_eq!(hist.max(), 10);
            }
            other => panic!("unexpected: {other:?}"),
        }
        match reg.merged("latency", &tags(&[("group", "x")])) {
            Some(MetricValue::Trend { hist }) => assert_eq!(hist.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn mismatched_kind_samples_are_dropped() {
        let reg = Registry::new();
        let t = Tags::new();
        reg.add_counter("mixed", 1.0, &t);
        reg.add_rate("mixed", true, &t);
        match reg.merged("mixed", &t) {
            Some(MetricValue::Counter { sum }) => assert_eq!(sum, 1.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_metric_merges_to_none() {
        let reg = Registry::new();
        assert!(reg.merged("nope", &Tags::new()).is_none());
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        use std::sync::Arc;
        let reg = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                let t = Tags::new();
                for _ in 0..1000 {
                    reg.add_counter("hits", 1.0, &t);
                }
            }));
        }
        for h in handles {
            h.join().expect("writer thread panicked");
        }
        match reg.merged("hits", &Tags::new()) {
            Some(MetricValue::Counter { sum }) => assert_eq!(sum, 8000.0),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
