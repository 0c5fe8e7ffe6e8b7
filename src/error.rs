use std::path::PathBuf;

use thiserror::Error;

use crate::stats::MetricKind;

/// Errors that make a run impossible to start. All of them surface before
/// any virtual user is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("no stages configured: set `stages` or pass `--vus` together with `--duration`")]
    NoStages,

    #[error("total stage duration is too long")]
    StagesTooLong,

    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("invalid threshold '{expression}' on '{metric}': {source}")]
    Threshold {
        metric: String,
        expression: String,
        #[source]
        source: ThresholdParseError,
    },

    #[error("threshold references unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("metric '{name}' is already registered as a {existing}")]
    MetricConflict { name: String, existing: MetricKind },

    #[error("invalid workload: {0}")]
    Workload(String),
}

/// Problems with a single threshold expression or its metric selector.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdParseError {
    #[error("malformed expression, expected something like 'p(95) < 500'")]
    Malformed,

    #[error("unknown aggregation '{0}'")]
    UnknownAggregation(String),

    #[error("percentile {0} is outside 0..=100")]
    PercentileOutOfRange(f64),

    #[error("aggregation '{aggregation}' cannot be used on {kind} metrics")]
    NotApplicable {
        aggregation: String,
        kind: MetricKind,
    },

    #[error("malformed metric selector '{0}', expected name{{tag:value}}")]
    Selector(String),
}
