use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::stats::summary::{AbortReason, RunSummary};
use crate::stats::threshold::{ThresholdEvaluator, ThresholdSpec};
use crate::stats::{names, MetricsRegistry, Tags};
use crate::utils::format_duration;

pub mod control;
pub mod executor;
pub mod http_client;
pub mod http_workload;
pub mod scheduler;
pub mod stages;

pub use control::{AbortHandle, RunContext};
pub use executor::{IterationSettings, RequestSample, VuContext, Workload};
pub use scheduler::ShutdownReport;
pub use stages::{Stage, StagePlan};

/// Fully validated knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub stages: Vec<Stage>,
    pub start_vus: usize,
    pub thresholds: Vec<ThresholdSpec>,
    pub pacing: Duration,
    pub min_iteration_duration: Option<Duration>,
    pub iteration_timeout: Option<Duration>,
    pub graceful_stop: Duration,
    pub graceful_ramp_down: Duration,
    /// Control loop period.
    pub tick: Duration,
    pub threshold_interval: Duration,
    /// Default for thresholds that do not set it themselves.
    pub abort_on_fail: bool,
    /// Metric shard count; derived from the peak VU count when unset.
    pub shards: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            start_vus: 0,
            thresholds: Vec::new(),
            pacing: Duration::ZERO,
            min_iteration_duration: None,
            iteration_timeout: None,
            graceful_stop: Duration::from_secs(30),
            graceful_ramp_down: Duration::from_secs(30),
            tick: Duration::from_secs(1),
            threshold_interval: Duration::from_secs(2),
            abort_on_fail: false,
            shards: None,
        }
    }
}

impl RunOptions {
    pub fn plan(&self) -> Result<StagePlan, ConfigError> {
        StagePlan::new(self.start_vus, self.stages.clone())
    }

    fn iteration_settings(&self) -> IterationSettings {
        IterationSettings {
            pacing: self.pacing,
            min_iteration_duration: self.min_iteration_duration,
            iteration_timeout: self.iteration_timeout,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroInterval { field: "tick" });
        }
        if self.threshold_interval.is_zero() {
            return Err(ConfigError::ZeroInterval {
                field: "threshold_interval",
            });
        }
        if self.iteration_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroInterval {
                field: "iteration_timeout",
            });
        }
        Ok(())
    }
}

/// Drives one load test from setup to summary.
pub struct Engine {
    options: RunOptions,
    workload: Arc<dyn Workload>,
    ctx: Arc<RunContext>,
    evaluator: ThresholdEvaluator,
}

impl Engine {
    /// Validate options and fix the metric set. Every configuration error
    /// surfaces here, before any load is generated.
    pub fn new(options: RunOptions, workload: Arc<dyn Workload>) -> Result<Self, ConfigError> {
        options.validate()?;
        let plan = options.plan()?;

        let shards = options
            .shards
            .unwrap_or_else(|| MetricsRegistry::shards_for(plan.max_target()));
        let mut registry = MetricsRegistry::new(shards);
        for (name, kind) in workload.custom_metrics() {
            registry.register(&name, kind)?;
        }
        let evaluator =
            ThresholdEvaluator::build(&options.thresholds, &mut registry, options.abort_on_fail)?;

        let ctx = Arc::new(RunContext::new(plan, Arc::new(registry)));
        Ok(Self {
            options,
            workload,
            ctx,
            evaluator,
        })
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.ctx.metrics().clone()
    }

    pub fn plan(&self) -> &StagePlan {
        self.ctx.plan()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.ctx.clone())
    }

    /// Stop the run from outside; reported as an external abort.
    pub fn abort(&self) -> bool {
        self.ctx.abort(AbortReason::External)
    }

    pub async fn run(self) -> Result<RunSummary> {
        let Engine {
            options,
            workload,
            ctx,
            evaluator,
        } = self;
        let metrics = ctx.metrics().clone();
        let plan = ctx.plan().clone();
        let none = Tags::new();

        info!(
            stages = plan.stages().len(),
            max_vus = plan.max_target(),
            duration = %format_duration(plan.total_duration()),
            thresholds = evaluator.len(),
            "starting run"
        );

        workload.setup().await.context("workload setup failed")?;

        metrics.mark_started();
        metrics.add(0, names::VUS_MAX, plan.max_target() as f64, &none);

        let stop_thresholds = CancellationToken::new();
        let threshold_task = tokio::spawn(watch_thresholds(
            evaluator,
            ctx.clone(),
            options.threshold_interval,
            stop_thresholds.clone(),
        ));

        let executor = Arc::new(executor::Executor::new(
            workload.clone(),
            metrics.clone(),
            options.iteration_settings(),
        ));
        let mut scheduler =
            scheduler::Scheduler::new(executor, ctx.token().clone(), options.graceful_ramp_down);

        let mut ticker = tokio::time::interval(options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.token().cancelled() => break,
            }
            let elapsed = ctx.elapsed();
            if plan.is_finished(elapsed) {
                break;
            }
            scheduler.reconcile(plan.target_at(elapsed));
            let interrupted = scheduler.reap();
            if interrupted > 0 {
                warn!(interrupted, "vus exceeded the graceful ramp-down period");
            }
            metrics.add(0, names::VUS, scheduler.active() as f64, &none);
        }

        if let Some(reason) = ctx.abort_reason() {
            info!(reason = ?reason, "run aborted, stopping vus");
        } else {
            info!("all stages complete, stopping vus");
        }
        let report = scheduler.shutdown(options.graceful_stop).await;
        metrics.add(0, names::VUS, 0.0, &none);

        stop_thresholds.cancel();
        let evaluator = threshold_task
            .await
            .context("threshold evaluator task failed")?;

        if let Err(err) = workload.teardown().await {
            warn!(error = %format!("{:#}", err), "workload teardown failed");
        }

        let snapshot = metrics.snapshot();
        let results = evaluator.finalize(&snapshot);
        let summary = RunSummary::new(snapshot.elapsed, &snapshot, results, ctx.abort_reason());
        info!(
            completed = report.completed,
            interrupted = report.interrupted,
            passed = summary.passed,
            "run finished"
        );
        Ok(summary)
    }
}

/// Periodically evaluate thresholds until told to stop or until one of
/// them aborts the run. Hands the evaluator back for the final verdict.
async fn watch_thresholds(
    mut evaluator: ThresholdEvaluator,
    ctx: Arc<RunContext>,
    every: Duration,
    stop: CancellationToken,
) -> ThresholdEvaluator {
    if evaluator.is_empty() {
        return evaluator;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = ctx.metrics().snapshot();
        if let Some(signal) = evaluator.evaluate(&snapshot) {
            warn!(
                metric = %signal.metric,
                threshold = %signal.expression,
                "threshold configured to abort was breached"
            );
            ctx.abort(AbortReason::Threshold {
                metric: signal.metric,
                expression: signal.expression,
            });
            break;
        }
    }
    evaluator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MetricKind;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Workload for Noop {
        async fn iteration(&self, _ctx: &mut VuContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        }

        fn custom_metrics(&self) -> Vec<(String, MetricKind)> {
            vec![("queue_depth".to_string(), MetricKind::Gauge)]
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            stages: vec![Stage::new(Duration::from_secs(2), 2)],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let opts = RunOptions::default();
        assert_eq!(opts.graceful_stop, Duration::from_secs(30));
        assert_eq!(opts.graceful_ramp_down, Duration::from_secs(30));
        assert_eq!(opts.tick, Duration::from_secs(1));
        assert_eq!(opts.threshold_interval, Duration::from_secs(2));
        assert!(!opts.abort_on_fail);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let empty = RunOptions::default();
        assert!(matches!(
            Engine::new(empty, Arc::new(Noop)),
            Err(ConfigError::NoStages)
        ));

        let zero_tick = RunOptions {
            tick: Duration::ZERO,
            ..options()
        };
        assert!(matches!(
            Engine::new(zero_tick, Arc::new(Noop)),
            Err(ConfigError::ZeroInterval { field: "tick" })
        ));

        let bad_threshold = RunOptions {
            thresholds: vec![ThresholdSpec::new("iterations", "p(95) < 100")],
            ..options()
        };
        assert!(matches!(
            Engine::new(bad_threshold, Arc::new(Noop)),
            Err(ConfigError::Threshold { .. })
        ));

        let unknown = RunOptions {
            thresholds: vec![ThresholdSpec::new("nope", "count > 1")],
            ..options()
        };
        assert!(matches!(
            Engine::new(unknown, Arc::new(Noop)),
            Err(ConfigError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_custom_metrics_are_registered() {
        let opts = RunOptions {
            thresholds: vec![ThresholdSpec::new("queue_depth", "value < 10")],
            ..options()
        };
        let engine = Engine::new(opts, Arc::new(Noop)).unwrap();
        assert_eq!(
            engine.metrics().kind_of("queue_depth"),
            Some(MetricKind::Gauge)
        );
        assert_eq!(engine.plan().max_target(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_run() {
        let engine = Engine::new(options(), Arc::new(Noop)).unwrap();
        let summary = engine.run().await.unwrap();
        assert!(summary.passed);
        assert!(summary.aborted.is_none());
        assert!(summary.duration_ms >= 2_000);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_abort() {
        let opts = RunOptions {
            stages: vec![Stage::new(Duration::from_secs(600), 5)],
            ..Default::default()
        };
        let engine = Engine::new(opts, Arc::new(Noop)).unwrap();
        let handle = engine.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            handle.abort();
        });

        let summary = engine.run().await.unwrap();
        assert_eq!(summary.aborted, Some(AbortReason::External));
        assert_eq!(summary.exit_code(), 105);
        assert!(summary.duration_ms < 10_000);
    }
}
