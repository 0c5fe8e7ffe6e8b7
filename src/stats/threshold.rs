//! Pass/fail rules over aggregated metrics.
//!
//! A threshold is written as `<aggregation> <operator> <bound>`, for example
//! `p(95) < 500` or `rate>0.99`, and attached to a metric name that may carry
//! a tag selector (`http_req_duration{name:api}`).

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tokio::time::Duration;
use tracing::warn;

use super::{MetricKind, MetricSnapshot, MetricsRegistry, Snapshot, Tags};
use crate::error::{ConfigError, ThresholdParseError};

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([a-z]+(?:\(\s*[^)]*\))?|p[0-9.]+)\s*(===|==|!==|!=|<=|>=|<|>)\s*(\S+)\s*$")
        .expect("threshold regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
    Percentile(f64),
}

impl Aggregation {
    fn parse(s: &str) -> Result<Self, ThresholdParseError> {
        let s = s.trim();
        let agg = match s {
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            "value" => Aggregation::Value,
            _ => {
                // p(95), p(99.9) and the shorthand p95
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| s.strip_prefix('p'))
                    .ok_or_else(|| ThresholdParseError::UnknownAggregation(s.to_string()))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| ThresholdParseError::UnknownAggregation(s.to_string()))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(ThresholdParseError::PercentileOutOfRange(p));
                }
                Aggregation::Percentile(p)
            }
        };
        Ok(agg)
    }

    /// Whether this aggregation means anything for a metric of `kind`.
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        use Aggregation::*;
        match kind {
            MetricKind::Counter => matches!(self, Count | Rate),
            MetricKind::Gauge => matches!(self, Value | Min | Max),
            MetricKind::Rate => matches!(self, Rate),
            MetricKind::Trend => matches!(self, Avg | Min | Max | Med | Count | Percentile(_)),
        }
    }

    pub fn apply(&self, metric: &MetricSnapshot) -> f64 {
        match self {
            Aggregation::Avg => metric.avg(),
            Aggregation::Min => metric.min(),
            Aggregation::Max => metric.max(),
            Aggregation::Med => metric.med(),
            Aggregation::Count => metric.count(),
            Aggregation::Rate => metric.rate(),
            Aggregation::Value => metric.value(),
            Aggregation::Percentile(p) => metric.percentile(*p),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Value => f.write_str("value"),
            Aggregation::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    fn parse(s: &str) -> Result<Self, ThresholdParseError> {
        match s {
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            ">" => Ok(Comparator::Gt),
            ">=" => Ok(Comparator::Ge),
            "==" | "===" => Ok(Comparator::Eq),
            "!=" | "!==" => Ok(Comparator::Ne),
            _ => Err(ThresholdParseError::Malformed),
        }
    }

    pub fn holds(&self, actual: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => actual < bound,
            Comparator::Le => actual <= bound,
            Comparator::Gt => actual > bound,
            Comparator::Ge => actual >= bound,
            Comparator::Eq => (actual - bound).abs() < f64::EPSILON,
            Comparator::Ne => (actual - bound).abs() >= f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// A parsed `<aggregation> <op> <bound>` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub bound: f64,
}

impl FromStr for ThresholdExpr {
    type Err = ThresholdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = EXPRESSION.captures(s).ok_or(ThresholdParseError::Malformed)?;
        let aggregation = Aggregation::parse(&caps[1])?;
        let comparator = Comparator::parse(&caps[2])?;
        let bound: f64 = caps[3]
            .parse()
            .map_err(|_| ThresholdParseError::Malformed)?;
        if !bound.is_finite() {
            return Err(ThresholdParseError::Malformed);
        }
        Ok(Self {
            aggregation,
            comparator,
            bound,
        })
    }
}

impl ThresholdExpr {
    pub fn evaluate(&self, metric: &MetricSnapshot) -> (f64, bool) {
        let actual = self.aggregation.apply(metric);
        (actual, self.comparator.holds(actual, self.bound))
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.aggregation, self.comparator, self.bound)
    }
}

/// Split `name{tag:value,other:"x"}` into the parent name and its tags.
pub fn parse_metric_selector(s: &str) -> Result<(String, Tags), ThresholdParseError> {
    let s = s.trim();
    let Some(open) = s.find('{') else {
        if s.is_empty() || s.contains('}') {
            return Err(ThresholdParseError::Selector(s.to_string()));
        }
        return Ok((s.to_string(), Tags::new()));
    };
    let name = s[..open].trim();
    let body = s[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| ThresholdParseError::Selector(s.to_string()))?;
    if name.is_empty() {
        return Err(ThresholdParseError::Selector(s.to_string()));
    }

    let mut tags = Tags::new();
    for pair in body.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| ThresholdParseError::Selector(s.to_string()))?;
        let k = k.trim();
        let v = v.trim().trim_matches(|c| c == '"' || c == '\'');
        if k.is_empty() {
            return Err(ThresholdParseError::Selector(s.to_string()));
        }
        tags.insert(k.to_string(), v.to_string());
    }
    if tags.is_empty() {
        return Err(ThresholdParseError::Selector(s.to_string()));
    }
    Ok((name.to_string(), tags))
}

/// Configured threshold before validation against the metric registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expression: String,
    pub abort_on_fail: Option<bool>,
    pub delay_abort_eval: Option<Duration>,
}

impl ThresholdSpec {
    pub fn new(metric: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            expression: expression.into(),
            abort_on_fail: None,
            delay_abort_eval: None,
        }
    }

    pub fn abort_on_fail(mut self, delay: Option<Duration>) -> Self {
        self.abort_on_fail = Some(true);
        self.delay_abort_eval = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Threshold {
    /// Series the threshold reads, including any submetric selector.
    pub metric: String,
    pub source: String,
    pub expr: ThresholdExpr,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub actual: f64,
    pub passed: bool,
    /// The threshold failed on at least one periodic evaluation.
    pub breached_during_run: bool,
    /// This threshold triggered an abort of the run.
    pub aborted_run: bool,
}

/// Reason a periodic evaluation wants the run stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortSignal {
    pub metric: String,
    pub expression: String,
}

struct ThresholdState {
    threshold: Threshold,
    breached: bool,
    aborted_run: bool,
}

pub struct ThresholdEvaluator {
    states: Vec<ThresholdState>,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        let states = thresholds
            .into_iter()
            .map(|threshold| ThresholdState {
                threshold,
                breached: false,
                aborted_run: false,
            })
            .collect();
        Self { states }
    }

    /// Parse and type-check every threshold, registering submetrics as needed.
    /// Any error here is fatal before load starts.
    pub fn build(
        specs: &[ThresholdSpec],
        registry: &mut MetricsRegistry,
        default_abort_on_fail: bool,
    ) -> Result<Self, ConfigError> {
        let mut thresholds = Vec::with_capacity(specs.len());
        for spec in specs {
            let wrap = |source: ThresholdParseError| ConfigError::Threshold {
                metric: spec.metric.clone(),
                expression: spec.expression.clone(),
                source,
            };

            let expr: ThresholdExpr = spec.expression.parse().map_err(wrap)?;
            let (parent, tags) = parse_metric_selector(&spec.metric).map_err(wrap)?;
            let kind = registry
                .kind_of(&parent)
                .ok_or_else(|| ConfigError::UnknownMetric(parent.clone()))?;
            if !expr.aggregation.applies_to(kind) {
                return Err(wrap(ThresholdParseError::NotApplicable {
                    aggregation: expr.aggregation.to_string(),
                    kind,
                }));
            }
            let metric = if tags.is_empty() {
                parent
            } else {
                registry.register_submetric(&parent, tags)?
            };

            thresholds.push(Threshold {
                metric,
                source: spec.expression.trim().to_string(),
                expr,
                abort_on_fail: spec.abort_on_fail.unwrap_or(default_abort_on_fail),
                delay_abort_eval: spec.delay_abort_eval.unwrap_or_default(),
            });
        }
        Ok(Self::new(thresholds))
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Periodic evaluation while the run is in progress. A breach is
    /// remembered and fails the final verdict. Returns an abort signal for
    /// the first breached threshold configured to abort whose delay has
    /// elapsed. Series with no samples yet are skipped.
    pub fn evaluate(&mut self, snapshot: &Snapshot) -> Option<AbortSignal> {
        let mut abort = None;
        for state in &mut self.states {
            let Some(metric) = snapshot.get(&state.threshold.metric) else {
                continue;
            };
            if metric.samples() == 0 {
                continue;
            }
            let (actual, passed) = state.threshold.expr.evaluate(metric);
            if passed {
                continue;
            }
            if !state.breached {
                warn!(
                    metric = %state.threshold.metric,
                    threshold = %state.threshold.source,
                    actual,
                    "threshold breached"
                );
            }
            state.breached = true;
            if abort.is_none()
                && state.threshold.abort_on_fail
                && snapshot.elapsed >= state.threshold.delay_abort_eval
            {
                state.aborted_run = true;
                abort = Some(AbortSignal {
                    metric: state.threshold.metric.clone(),
                    expression: state.threshold.source.clone(),
                });
            }
        }
        abort
    }

    /// End-of-run verdict: a threshold passes only if it holds on the final
    /// snapshot and never breached while the run was in progress.
    pub fn finalize(&self, snapshot: &Snapshot) -> Vec<ThresholdResult> {
        self.states
            .iter()
            .map(|state| {
                let (actual, passed) = snapshot
                    .get(&state.threshold.metric)
                    .map(|m| state.threshold.expr.evaluate(m))
                    .unwrap_or((0.0, false));
                ThresholdResult {
                    metric: state.threshold.metric.clone(),
                    expression: state.threshold.source.clone(),
                    actual,
                    passed: passed && !state.breached && !state.aborted_run,
                    breached_during_run: state.breached || !passed,
                    aborted_run: state.aborted_run,
                }
            })
            .collect()
    }
}
