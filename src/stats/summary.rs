use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::Duration;

use super::threshold::ThresholdResult;
use super::{names, CheckTally, MetricKind, MetricSnapshot, Snapshot};
use crate::utils::format_duration;

/// Process exit codes, aligned with k6 so CI scripts can treat both alike.
pub mod exit_code {
    pub const OK: u8 = 0;
    pub const GENERIC_ERROR: u8 = 1;
    pub const THRESHOLDS_FAILED: u8 = 99;
    pub const INVALID_CONFIG: u8 = 104;
    pub const EXTERNAL_ABORT: u8 = 105;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// A threshold configured with abort-on-fail was breached.
    Threshold { metric: String, expression: String },
    /// Stopped from outside the engine (Ctrl-C, `Engine::abort`).
    External,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: f64,
        rate: f64,
    },
    Gauge {
        value: f64,
        min: f64,
        max: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        avg: f64,
        min: f64,
        med: f64,
        max: f64,
        p90: f64,
        p95: f64,
        p99: f64,
        count: u64,
    },
}

impl MetricSummary {
    pub fn from_snapshot(metric: &MetricSnapshot) -> Self {
        match metric.kind() {
            MetricKind::Counter => MetricSummary::Counter {
                count: metric.count(),
                rate: metric.rate(),
            },
            MetricKind::Gauge => MetricSummary::Gauge {
                value: metric.value(),
                min: metric.min(),
                max: metric.max(),
            },
            MetricKind::Rate => MetricSummary::Rate {
                rate: metric.rate(),
                passes: metric.passes(),
                fails: metric.fails(),
            },
            MetricKind::Trend => MetricSummary::Trend {
                avg: metric.avg(),
                min: metric.min(),
                med: metric.med(),
                max: metric.max(),
                p90: metric.percentile(90.0),
                p95: metric.percentile(95.0),
                p99: metric.percentile(99.0),
                count: metric.samples(),
            },
        }
    }

    fn render(&self) -> String {
        match self {
            MetricSummary::Counter { count, rate } => format!("{} {:.2}/s", count, rate),
            MetricSummary::Gauge { value, min, max } => {
                format!("{} min={} max={}", value, min, max)
            }
            MetricSummary::Rate {
                rate,
                passes,
                fails,
            } => format!("{:.2}% {} / {}", rate * 100.0, passes, passes + fails),
            MetricSummary::Trend {
                avg,
                min,
                med,
                max,
                p90,
                p95,
                ..
            } => format!(
                "avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms p(90)={:.2}ms p(95)={:.2}ms",
                avg, min, med, max, p90, p95
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

/// Structured result of a run: per-metric aggregates, per-threshold
/// verdicts and the overall outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub duration_ms: u128,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub checks: Vec<CheckSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
    pub aborted: Option<AbortReason>,
}

impl RunSummary {
    pub fn new(
        duration: Duration,
        snapshot: &Snapshot,
        thresholds: Vec<ThresholdResult>,
        aborted: Option<AbortReason>,
    ) -> Self {
        let metrics = snapshot
            .metrics
            .iter()
            .map(|(name, m)| (name.clone(), MetricSummary::from_snapshot(m)))
            .collect();
        let checks = snapshot
            .checks
            .iter()
            .map(|(name, CheckTally { passes, fails })| CheckSummary {
                name: name.clone(),
                passes: *passes,
                fails: *fails,
            })
            .collect();
        let passed = thresholds.iter().all(|t| t.passed);

        Self {
            duration_ms: duration.as_millis(),
            metrics,
            checks,
            thresholds,
            passed,
            aborted,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match (&self.aborted, self.passed) {
            (Some(AbortReason::External), _) => exit_code::EXTERNAL_ABORT,
            (_, false) => exit_code::THRESHOLDS_FAILED,
            _ => exit_code::OK,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Human-readable report on stdout.
    pub fn report(&self) {
        println!("\n--- Run Summary ---");
        println!(
            "Duration: {}",
            format_duration(Duration::from_millis(self.duration_ms as u64))
        );

        if !self.checks.is_empty() {
            println!("\nChecks:");
            for check in &self.checks {
                let total = check.passes + check.fails;
                let percent = if total > 0 {
                    check.passes as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                let mark = if check.fails == 0 { "✓" } else { "✗" };
                if check.fails > 0 {
                    println!(
                        "  {} {} : {:.2}% ({} passed, {} failed)",
                        mark, check.name, percent, check.passes, check.fails
                    );
                } else {
                    println!("  {} {} : 100% ({} passed)", mark, check.name, check.passes);
                }
            }
        }

        println!("\nMetrics:");
        let width = self.metrics.keys().map(|k| k.len()).max().unwrap_or(0);
        for (name, metric) in &self.metrics {
            // Skip HTTP metrics for workloads that never made a request.
            if name.starts_with("http_") || name.starts_with("data_") {
                let empty = matches!(
                    self.metrics.get(names::HTTP_REQS),
                    Some(MetricSummary::Counter { count, .. }) if *count == 0.0
                );
                if empty {
                    continue;
                }
            }
            let mark = self.threshold_mark(name);
            println!("  {} {:<width$} {}", mark, name, metric.render(), width = width);
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for t in &self.thresholds {
                let status = if t.passed { "PASS" } else { "FAIL" };
                println!(
                    "  [{}] {} {} (actual: {:.4})",
                    status, t.metric, t.expression, t.actual
                );
            }
        }

        match &self.aborted {
            Some(AbortReason::Threshold { metric, expression }) => {
                println!("\nRun aborted: threshold '{} {}' breached", metric, expression)
            }
            Some(AbortReason::External) => println!("\nRun aborted by user"),
            None => {}
        }

        let verdict = if self.passed { "PASSED" } else { "FAILED" };
        println!("\nResult: {}", verdict);
        println!("-------------------\n");
    }

    fn threshold_mark(&self, metric: &str) -> &'static str {
        let mut relevant = self.thresholds.iter().filter(|t| t.metric == metric).peekable();
        if relevant.peek().is_none() {
            " "
        } else if relevant.all(|t| t.passed) {
            "✓"
        } else {
            "✗"
        }
    }
}
