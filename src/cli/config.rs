use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::time::Duration;

use crate::engine::http_workload::HttpWorkloadConfig;
use crate::engine::{RunOptions, Stage};
use crate::error::ConfigError;
use crate::stats::threshold::ThresholdSpec;
use crate::utils::{parse_duration, parse_optional_duration};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StageConfig {
    pub duration: String,
    pub target: usize,
}

/// A threshold is either a bare expression or the k6 object form.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdConfig {
    Expression(String),
    Detailed {
        threshold: String,
        /// Stop the run as soon as this threshold is breached
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: Option<bool>,
        /// Do not abort before this much run time has elapsed
        #[serde(default, alias = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct Config {
    /// Ramping profile (k6: stages)
    #[serde(alias = "schedule")]
    pub stages: Option<Vec<StageConfig>>,
    /// VU count at time zero, ramped from by the first stage
    #[serde(alias = "startVUs", alias = "startVus")]
    pub start_vus: Option<usize>,
    /// Constant VU count, used with `duration` when no stages are set
    pub vus: Option<usize>,
    /// Duration of a constant profile (e.g., "30s")
    pub duration: Option<String>,
    /// Pass/fail criteria keyed by metric or `metric{tag:value}` selector
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdConfig>>>,
    /// Sleep after every iteration (e.g., "1s")
    pub pacing: Option<String>,
    /// Minimum time per iteration
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
    /// Upper bound for a single iteration
    #[serde(alias = "iterationTimeout")]
    pub iteration_timeout: Option<String>,
    /// How long to wait for in-flight iterations at the end (default: 30s)
    #[serde(alias = "gracefulStop")]
    pub graceful_stop: Option<String>,
    /// How long a retiring VU may finish its iteration (default: 30s)
    #[serde(alias = "gracefulRampDown")]
    pub graceful_ramp_down: Option<String>,
    /// Scheduler tick (default: 1s)
    pub tick: Option<String>,
    /// Threshold evaluation period while running (default: 2s)
    #[serde(alias = "thresholdInterval")]
    pub threshold_interval: Option<String>,
    /// Default abort policy for thresholds without their own setting
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// Runtime worker threads (default: derived from peak VUs)
    pub threads: Option<usize>,
    /// HTTP requests executed once per iteration
    pub workload: Option<HttpWorkloadConfig>,
}

impl Config {
    /// Read a YAML or JSON config; the format follows the file extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = if ext == "json" {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn stages(&self) -> Result<Vec<Stage>, ConfigError> {
        if let Some(stages) = &self.stages {
            return stages
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let field = format!("stages[{}].duration", i);
                    Ok(Stage::new(parse_duration(&field, &s.duration)?, s.target))
                })
                .collect();
        }
        match (self.vus, &self.duration) {
            (Some(vus), Some(duration)) => {
                Ok(vec![Stage::new(parse_duration("duration", duration)?, vus)])
            }
            _ => Err(ConfigError::NoStages),
        }
    }

    pub fn threshold_specs(&self) -> Result<Vec<ThresholdSpec>, ConfigError> {
        let mut specs = Vec::new();
        let Some(thresholds) = &self.thresholds else {
            return Ok(specs);
        };
        for (metric, list) in thresholds {
            for item in list {
                let spec = match item {
                    ThresholdConfig::Expression(expr) => ThresholdSpec::new(metric, expr),
                    ThresholdConfig::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let field = format!("thresholds.{}.delay_abort_eval", metric);
                        ThresholdSpec {
                            abort_on_fail: *abort_on_fail,
                            delay_abort_eval: parse_optional_duration(
                                &field,
                                delay_abort_eval.as_deref(),
                            )?,
                            ..ThresholdSpec::new(metric, threshold)
                        }
                    }
                };
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    /// Turn the raw file values into validated run options.
    pub fn into_options(&self) -> Result<RunOptions, ConfigError> {
        let defaults = RunOptions::default();
        let duration_or = |field: &str, value: &Option<String>, default: Duration| {
            parse_optional_duration(field, value.as_deref()).map(|d| d.unwrap_or(default))
        };

        let stages = self.stages()?;
        let start_vus = match (&self.stages, self.start_vus) {
            (_, Some(n)) => n,
            // constant profile starts at full strength
            (None, None) => stages.first().map(|s| s.target).unwrap_or(0),
            (Some(_), None) => 0,
        };

        Ok(RunOptions {
            stages,
            start_vus,
            thresholds: self.threshold_specs()?,
            pacing: duration_or("pacing", &self.pacing, defaults.pacing)?,
            min_iteration_duration: parse_optional_duration(
                "min_iteration_duration",
                self.min_iteration_duration.as_deref(),
            )?,
            iteration_timeout: parse_optional_duration(
                "iteration_timeout",
                self.iteration_timeout.as_deref(),
            )?,
            graceful_stop: duration_or("graceful_stop", &self.graceful_stop, defaults.graceful_stop)?,
            graceful_ramp_down: duration_or(
                "graceful_ramp_down",
                &self.graceful_ramp_down,
                defaults.graceful_ramp_down,
            )?,
            tick: duration_or("tick", &self.tick, defaults.tick)?,
            threshold_interval: duration_or(
                "threshold_interval",
                &self.threshold_interval,
                defaults.threshold_interval,
            )?,
            abort_on_fail: self.abort_on_fail.unwrap_or(defaults.abort_on_fail),
            shards: None,
        })
    }
}
