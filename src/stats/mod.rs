use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::error::ConfigError;

pub mod csv;
pub mod summary;
pub mod threshold;

/// Sample tags. Ordered so submetric names render deterministically.
pub type Tags = BTreeMap<String, String>;

/// Names of the metrics every run records.
pub mod names {
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
    pub const CHECKS: &str = "checks";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
    pub const HTTP_REQ_RECEIVING: &str = "http_req_receiving";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_SENT: &str = "data_sent";
    pub const DATA_RECEIVED: &str = "data_received";
}

pub const BUILTIN_METRICS: &[(&str, MetricKind)] = &[
    (names::VUS, MetricKind::Gauge),
    (names::VUS_MAX, MetricKind::Gauge),
    (names::ITERATIONS, MetricKind::Counter),
    (names::ITERATION_DURATION, MetricKind::Trend),
    (names::ITERATION_FAILED, MetricKind::Rate),
    (names::INTERRUPTED_ITERATIONS, MetricKind::Counter),
    (names::CHECKS, MetricKind::Rate),
    (names::HTTP_REQS, MetricKind::Counter),
    (names::HTTP_REQ_DURATION, MetricKind::Trend),
    (names::HTTP_REQ_WAITING, MetricKind::Trend),
    (names::HTTP_REQ_RECEIVING, MetricKind::Trend),
    (names::HTTP_REQ_FAILED, MetricKind::Rate),
    (names::DATA_SENT, MetricKind::Counter),
    (names::DATA_RECEIVED, MetricKind::Counter),
];

/// Trend values are kept in thousandths inside the histogram, so a trend of
/// milliseconds is stored with microsecond resolution.
const TREND_SCALE: f64 = 1000.0;
/// Upper bound of every trend histogram: one hour in microseconds. Larger
/// samples are clamped instead of rejected.
const HISTOGRAM_MAX: u64 = 60 * 60 * 1000 * 1000;
const HISTOGRAM_SIGFIG: u8 = 2;

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX, HISTOGRAM_SIGFIG)
        .expect("histogram bounds are static and valid")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Cumulative sum (`iterations`, `data_sent`).
    Counter,
    /// Last written value (`vus`).
    Gauge,
    /// Fraction of non-zero samples (`checks`, `http_req_failed`).
    Rate,
    /// Distribution of values (`http_req_duration`).
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// Accumulated state of one series in one shard.
#[derive(Debug, Clone)]
enum Sink {
    Counter {
        total: f64,
        samples: u64,
    },
    Gauge {
        value: f64,
        stamp: u64,
        min: f64,
        max: f64,
        samples: u64,
    },
    Rate {
        hits: u64,
        total: u64,
    },
    Trend {
        histogram: Histogram<u64>,
        samples: u64,
        sum: f64,
        min: f64,
        max: f64,
    },
}

impl Sink {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Sink::Counter {
                total: 0.0,
                samples: 0,
            },
            MetricKind::Gauge => Sink::Gauge {
                value: 0.0,
                stamp: 0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                samples: 0,
            },
            MetricKind::Rate => Sink::Rate { hits: 0, total: 0 },
            MetricKind::Trend => Sink::Trend {
                histogram: new_histogram(),
                samples: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
        }
    }

    fn add(&mut self, value: f64, stamp: u64) {
        match self {
            Sink::Counter { total, samples } => {
                // Counters only grow; negative deltas are dropped.
                if value >= 0.0 {
                    *total += value;
                    *samples += 1;
                }
            }
            Sink::Gauge {
                value: current,
                stamp: current_stamp,
                min,
                max,
                samples,
            } => {
                if stamp >= *current_stamp {
                    *current = value;
                    *current_stamp = stamp;
                }
                *min = min.min(value);
                *max = max.max(value);
                *samples += 1;
            }
            Sink::Rate { hits, total } => {
                *total += 1;
                if value != 0.0 {
                    *hits += 1;
                }
            }
            Sink::Trend {
                histogram,
                samples,
                sum,
                min,
                max,
            } => {
                let scaled = (value * TREND_SCALE).round().max(1.0) as u64;
                histogram.saturating_record(scaled);
                *samples += 1;
                *sum += value;
                *min = min.min(value);
                *max = max.max(value);
            }
        }
    }

    fn merge(&mut self, other: &Sink) {
        match (self, other) {
            (
                Sink::Counter { total, samples },
                Sink::Counter {
                    total: t,
                    samples: s,
                },
            ) => {
                *total += t;
                *samples += s;
            }
            (
                Sink::Gauge {
                    value,
                    stamp,
                    min,
                    max,
                    samples,
                },
                Sink::Gauge {
                    value: v,
                    stamp: st,
                    min: mn,
                    max: mx,
                    samples: s,
                },
            ) => {
                if *s > 0 && *st >= *stamp {
                    *value = *v;
                    *stamp = *st;
                }
                *min = min.min(*mn);
                *max = max.max(*mx);
                *samples += s;
            }
            (Sink::Rate { hits, total }, Sink::Rate { hits: h, total: t }) => {
                *hits += h;
                *total += t;
            }
            (
                Sink::Trend {
                    histogram,
                    samples,
                    sum,
                    min,
                    max,
                },
                Sink::Trend {
                    histogram: hist,
                    samples: s,
                    sum: su,
                    min: mn,
                    max: mx,
                },
            ) => {
                // Both histograms share the same bounds, so add cannot fail.
                let _ = histogram.add(hist);
                *samples += s;
                *sum += su;
                *min = min.min(*mn);
                *max = max.max(*mx);
            }
            _ => {}
        }
    }
}

/// One series split into independently locked shards.
struct Series {
    kind: MetricKind,
    shards: Box<[Mutex<Sink>]>,
}

impl Series {
    fn new(kind: MetricKind, shard_count: usize) -> Self {
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Sink::new(kind)))
            .collect();
        Self { kind, shards }
    }

    fn add(&self, shard_key: usize, value: f64, stamp: u64) {
        let idx = shard_key % self.shards.len();
        self.shards[idx].lock().add(value, stamp);
    }

    fn collect(&self) -> Sink {
        let mut merged = Sink::new(self.kind);
        for shard in self.shards.iter() {
            merged.merge(&shard.lock());
        }
        merged
    }
}

struct Submetric {
    name: String,
    tags: Tags,
    series: Series,
}

struct MetricEntry {
    series: Series,
    submetrics: Vec<Submetric>,
}

/// Render the name of a submetric, e.g. `http_req_duration{name:api}`.
pub fn submetric_name(parent: &str, tags: &Tags) -> String {
    let mut name = parent.to_string();
    name.push('{');
    for (i, (k, v)) in tags.iter().enumerate() {
        if i > 0 {
            name.push(',');
        }
        name.push_str(k);
        name.push(':');
        name.push_str(v);
    }
    name.push('}');
    name
}

/// Thread-safe store for every metric of a run.
///
/// The set of metrics is fixed before the run starts, so writers only take
/// the lock of one shard of one series. Shards are chosen by the caller's
/// key (the VU id), which keeps VUs from contending with each other.
pub struct MetricsRegistry {
    metrics: HashMap<String, MetricEntry>,
    checks: Box<[Mutex<HashMap<String, CheckTally>>]>,
    shard_count: usize,
    clock: AtomicU64,
    started: Mutex<Option<Instant>>,
    warned: Mutex<HashSet<String>>,
}

impl MetricsRegistry {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut registry = Self {
            metrics: HashMap::new(),
            checks: (0..shard_count)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            shard_count,
            clock: AtomicU64::new(0),
            started: Mutex::new(None),
            warned: Mutex::new(HashSet::new()),
        };
        for (name, kind) in BUILTIN_METRICS {
            registry.insert(name, *kind);
        }
        registry
    }

    /// Shard count for a run peaking at `peak_vus` users: about 100 VUs per
    /// shard, never fewer than 16 or more than 256.
    pub fn shards_for(peak_vus: usize) -> usize {
        (peak_vus / 100).clamp(16, 256)
    }

    fn insert(&mut self, name: &str, kind: MetricKind) {
        self.metrics.insert(
            name.to_string(),
            MetricEntry {
                series: Series::new(kind, self.shard_count),
                submetrics: Vec::new(),
            },
        );
    }

    /// Declare a custom metric. Registering the same name twice with the
    /// same kind is a no-op.
    pub fn register(&mut self, name: &str, kind: MetricKind) -> Result<(), ConfigError> {
        match self.kind_of(name) {
            Some(existing) if existing == kind => Ok(()),
            Some(existing) => Err(ConfigError::MetricConflict {
                name: name.to_string(),
                existing,
            }),
            None => {
                self.insert(name, kind);
                Ok(())
            }
        }
    }

    /// Declare a submetric fed by every sample of `parent` whose tags
    /// include all of `tags`. Returns the submetric's series name.
    pub fn register_submetric(&mut self, parent: &str, tags: Tags) -> Result<String, ConfigError> {
        let shard_count = self.shard_count;
        let entry = self
            .metrics
            .get_mut(parent)
            .ok_or_else(|| ConfigError::UnknownMetric(parent.to_string()))?;
        let name = submetric_name(parent, &tags);
        if !entry.submetrics.iter().any(|s| s.name == name) {
            entry.submetrics.push(Submetric {
                name: name.clone(),
                tags,
                series: Series::new(entry.series.kind, shard_count),
            });
        }
        Ok(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.metrics.get(name).map(|m| m.series.kind)
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Start the clock used for counter rates.
    pub fn mark_started(&self) {
        *self.started.lock() = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    /// Record one sample. Unknown metric names are dropped with a single
    /// warning per name.
    pub fn add(&self, shard_key: usize, name: &str, value: f64, tags: &Tags) {
        let Some(entry) = self.metrics.get(name) else {
            if self.warned.lock().insert(name.to_string()) {
                warn!(metric = name, "dropping samples for unregistered metric");
            }
            return;
        };
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.series.add(shard_key, value, stamp);
        for sub in &entry.submetrics {
            if sub.tags.iter().all(|(k, v)| tags.get(k) == Some(v)) {
                sub.series.add(shard_key, value, stamp);
            }
        }
    }

    /// Record the outcome of a named check into `checks` and the per-name tally.
    pub fn record_check(&self, shard_key: usize, name: &str, passed: bool, tags: &Tags) {
        let mut tags = tags.clone();
        tags.insert("check".to_string(), name.to_string());
        self.add(shard_key, names::CHECKS, if passed { 1.0 } else { 0.0 }, &tags);

        let mut tally = self.checks[shard_key % self.shard_count].lock();
        let entry = tally.entry(name.to_string()).or_default();
        if passed {
            entry.passes += 1;
        } else {
            entry.fails += 1;
        }
    }

    /// Merge every shard into a point-in-time view.
    pub fn snapshot(&self) -> Snapshot {
        let elapsed = self.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        let mut metrics = BTreeMap::new();
        for (name, entry) in &self.metrics {
            metrics.insert(
                name.clone(),
                MetricSnapshot {
                    kind: entry.series.kind,
                    sink: entry.series.collect(),
                    elapsed_secs,
                },
            );
            for sub in &entry.submetrics {
                metrics.insert(
                    sub.name.clone(),
                    MetricSnapshot {
                        kind: sub.series.kind,
                        sink: sub.series.collect(),
                        elapsed_secs,
                    },
                );
            }
        }

        let mut checks: BTreeMap<String, CheckTally> = BTreeMap::new();
        for shard in self.checks.iter() {
            for (name, tally) in shard.lock().iter() {
                let entry = checks.entry(name.clone()).or_default();
                entry.passes += tally.passes;
                entry.fails += tally.fails;
            }
        }

        Snapshot {
            elapsed,
            metrics,
            checks,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

/// Merged view of the registry at one instant.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricSnapshot>,
    pub checks: BTreeMap<String, CheckTally>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }
}

/// Aggregated state of a single series.
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    kind: MetricKind,
    sink: Sink,
    elapsed_secs: f64,
}

impl MetricSnapshot {
    /// Trend snapshot built from raw values.
    pub fn from_trend_values(values: &[f64]) -> Self {
        let mut sink = Sink::new(MetricKind::Trend);
        for v in values {
            sink.add(*v, 0);
        }
        Self {
            kind: MetricKind::Trend,
            sink,
            elapsed_secs: 0.0,
        }
    }

    /// Rate snapshot with `hits` non-zero samples out of `total`.
    pub fn from_rate(hits: u64, total: u64) -> Self {
        Self {
            kind: MetricKind::Rate,
            sink: Sink::Rate {
                hits: hits.min(total),
                total,
            },
            elapsed_secs: 0.0,
        }
    }

    /// Counter snapshot summing to `total` over `elapsed`.
    pub fn from_counter(total: f64, elapsed: Duration) -> Self {
        Self {
            kind: MetricKind::Counter,
            sink: Sink::Counter { total, samples: 1 },
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn from_gauge(value: f64) -> Self {
        let mut sink = Sink::new(MetricKind::Gauge);
        sink.add(value, 1);
        Self {
            kind: MetricKind::Gauge,
            sink,
            elapsed_secs: 0.0,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Number of samples recorded.
    pub fn samples(&self) -> u64 {
        match &self.sink {
            Sink::Counter { samples, .. }
            | Sink::Gauge { samples, .. }
            | Sink::Trend { samples, .. } => *samples,
            Sink::Rate { total, .. } => *total,
        }
    }

    /// `count` aggregation: the sum for counters, the sample count otherwise.
    pub fn count(&self) -> f64 {
        match &self.sink {
            Sink::Counter { total, .. } => *total,
            _ => self.samples() as f64,
        }
    }

    /// `rate` aggregation: per-second throughput for counters, fraction of
    /// non-zero samples for rates.
    pub fn rate(&self) -> f64 {
        match &self.sink {
            Sink::Counter { total, .. } => {
                if self.elapsed_secs > 0.0 {
                    total / self.elapsed_secs
                } else {
                    0.0
                }
            }
            Sink::Rate { hits, total } => {
                if *total > 0 {
                    *hits as f64 / *total as f64
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    pub fn passes(&self) -> u64 {
        match &self.sink {
            Sink::Rate { hits, .. } => *hits,
            _ => 0,
        }
    }

    pub fn fails(&self) -> u64 {
        match &self.sink {
            Sink::Rate { hits, total } => total - hits,
            _ => 0,
        }
    }

    /// Last written gauge value.
    pub fn value(&self) -> f64 {
        match &self.sink {
            Sink::Gauge { value, .. } => *value,
            Sink::Counter { total, .. } => *total,
            _ => 0.0,
        }
    }

    pub fn avg(&self) -> f64 {
        match &self.sink {
            Sink::Trend { samples, sum, .. } if *samples > 0 => sum / *samples as f64,
            _ => 0.0,
        }
    }

    pub fn min(&self) -> f64 {
        match &self.sink {
            Sink::Trend { samples, min, .. } | Sink::Gauge { samples, min, .. }
                if *samples > 0 =>
            {
                *min
            }
            _ => 0.0,
        }
    }

    pub fn max(&self) -> f64 {
        match &self.sink {
            Sink::Trend { samples, max, .. } | Sink::Gauge { samples, max, .. }
                if *samples > 0 =>
            {
                *max
            }
            _ => 0.0,
        }
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }

    /// Estimated `p`th percentile (0-100) of a trend.
    pub fn percentile(&self, p: f64) -> f64 {
        match &self.sink {
            Sink::Trend {
                histogram, samples, ..
            } if *samples > 0 => {
                let q = (p / 100.0).clamp(0.0, 1.0);
                histogram.value_at_quantile(q) as f64 / TREND_SCALE
            }
            _ => 0.0,
        }
    }
}
