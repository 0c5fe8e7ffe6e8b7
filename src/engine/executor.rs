use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::scheduler::{VirtualUser, VuState};
use crate::stats::{names, MetricKind, MetricsRegistry, Tags};

/// User supplied load. One `iteration` call is one unit of work for a VU;
/// the engine calls it repeatedly from many tasks at once.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Runs once before the first VU starts.
    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn iteration(&self, ctx: &mut VuContext) -> anyhow::Result<()>;

    /// Runs once after the last VU has stopped.
    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Extra metrics written through the `VuContext` emitters. They must be
    /// declared up front because the registry is fixed once the run starts.
    fn custom_metrics(&self) -> Vec<(String, MetricKind)> {
        Vec::new()
    }
}

/// One request made by a workload, as reported to the `http_*` and `data_*`
/// metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSample {
    pub name: String,
    pub method: String,
    /// `None` when no response was received.
    pub status: Option<u16>,
    pub duration: Duration,
    /// Time to the response headers.
    pub waiting: Duration,
    /// Time spent reading the response body.
    pub receiving: Duration,
    pub sent: u64,
    pub received: u64,
    pub failed: bool,
}

impl RequestSample {
    fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("name".to_string(), self.name.clone());
        tags.insert("method".to_string(), self.method.clone());
        tags.insert(
            "status".to_string(),
            self.status.map(|s| s.to_string()).unwrap_or_else(|| "0".to_string()),
        );
        tags.insert("expected_response".to_string(), (!self.failed).to_string());
        tags
    }
}

/// Per-VU handle passed to every iteration.
pub struct VuContext {
    vu_id: usize,
    iteration: u64,
    metrics: Arc<MetricsRegistry>,
    checks: Vec<(String, bool)>,
    requests: Vec<RequestSample>,
}

impl VuContext {
    pub fn new(vu_id: usize, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            vu_id,
            iteration: 0,
            metrics,
            checks: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn vu_id(&self) -> usize {
        self.vu_id
    }

    /// Zero-based iteration number within this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Record a named assertion. Returns `passed` so it can be used inline.
    pub fn check(&mut self, name: impl Into<String>, passed: bool) -> bool {
        self.checks.push((name.into(), passed));
        passed
    }

    pub fn record_request(&mut self, sample: RequestSample) {
        self.requests.push(sample);
    }

    pub fn add_counter(&self, name: &str, value: f64) {
        self.emit(name, value, &Tags::new());
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.emit(name, value, &Tags::new());
    }

    pub fn add_rate(&self, name: &str, hit: bool) {
        self.emit(name, if hit { 1.0 } else { 0.0 }, &Tags::new());
    }

    pub fn add_trend(&self, name: &str, value: f64) {
        self.emit(name, value, &Tags::new());
    }

    /// Write a tagged sample to any registered metric.
    pub fn emit(&self, name: &str, value: f64, tags: &Tags) {
        self.metrics.add(self.vu_id, name, value, tags);
    }

    pub(crate) fn flush(&mut self, outcome: &IterationOutcome) {
        let metrics = &self.metrics;
        let shard = self.vu_id;
        let none = Tags::new();

        for (name, passed) in self.checks.drain(..) {
            metrics.record_check(shard, &name, passed, &none);
        }
        for request in self.requests.drain(..) {
            let tags = request.tags();
            metrics.add(shard, names::HTTP_REQS, 1.0, &tags);
            metrics.add(
                shard,
                names::HTTP_REQ_DURATION,
                request.duration.as_secs_f64() * 1000.0,
                &tags,
            );
            if request.status.is_some() {
                metrics.add(shard, names::HTTP_REQ_WAITING, millis(request.waiting), &tags);
                metrics.add(shard, names::HTTP_REQ_RECEIVING, millis(request.receiving), &tags);
            }
            metrics.add(
                shard,
                names::HTTP_REQ_FAILED,
                if request.failed { 1.0 } else { 0.0 },
                &tags,
            );
            metrics.add(shard, names::DATA_SENT, request.sent as f64, &tags);
            metrics.add(shard, names::DATA_RECEIVED, request.received as f64, &tags);
        }

        metrics.add(shard, names::ITERATIONS, 1.0, &none);
        metrics.add(
            shard,
            names::ITERATION_DURATION,
            outcome.duration.as_secs_f64() * 1000.0,
            &none,
        );
        metrics.add(
            shard,
            names::ITERATION_FAILED,
            if outcome.error.is_some() { 1.0 } else { 0.0 },
            &none,
        );
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IterationError {
    #[error("iteration failed: {0}")]
    Failed(String),
    #[error("iteration panicked: {0}")]
    Panicked(String),
    #[error("iteration timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub duration: Duration,
    pub error: Option<IterationError>,
}

impl IterationOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-iteration timing policy.
#[derive(Debug, Clone, Default)]
pub struct IterationSettings {
    /// Fixed sleep after every iteration.
    pub pacing: Duration,
    /// Iterations shorter than this sleep for the remainder.
    pub min_iteration_duration: Option<Duration>,
    pub iteration_timeout: Option<Duration>,
}

impl IterationSettings {
    pub fn delay_after(&self, elapsed: Duration) -> Duration {
        let floor = self
            .min_iteration_duration
            .map(|min| min.saturating_sub(elapsed))
            .unwrap_or_default();
        self.pacing + floor
    }
}

/// Runs iterations on behalf of VUs and records what they did.
pub struct Executor {
    workload: Arc<dyn Workload>,
    metrics: Arc<MetricsRegistry>,
    settings: IterationSettings,
}

impl Executor {
    pub fn new(
        workload: Arc<dyn Workload>,
        metrics: Arc<MetricsRegistry>,
        settings: IterationSettings,
    ) -> Self {
        Self {
            workload,
            metrics,
            settings,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Body of a VU task. Loops until `retire` fires; the check happens only
    /// between iterations, so an in-flight iteration always completes.
    pub async fn run_vu(&self, vu: Arc<VirtualUser>, retire: CancellationToken) {
        let mut ctx = VuContext::new(vu.id(), self.metrics.clone());
        debug!(vu = vu.id(), "vu started");

        while !retire.is_cancelled() {
            ctx.iteration = vu.iterations();
            vu.set_state(VuState::Running);
            let outcome = self.execute_iteration(&mut ctx).await;
            ctx.flush(&outcome);
            vu.complete_iteration();
            vu.set_state(VuState::Idle);

            if let Some(err) = &outcome.error {
                debug!(vu = vu.id(), iteration = ctx.iteration, error = %err, "iteration failed");
            }

            let delay = self.settings.delay_after(outcome.duration);
            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = retire.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        vu.set_state(VuState::Retired);
        debug!(vu = vu.id(), iterations = vu.iterations(), "vu retired");
    }

    /// Run one iteration, turning errors, panics and timeouts into a failed
    /// outcome instead of letting them escape.
    pub async fn execute_iteration(&self, ctx: &mut VuContext) -> IterationOutcome {
        let start = Instant::now();
        let fut = AssertUnwindSafe(self.workload.iteration(ctx)).catch_unwind();

        let error = match self.settings.iteration_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => classify(result),
                Err(_) => Some(IterationError::TimedOut(limit)),
            },
            None => classify(fut.await),
        };

        IterationOutcome {
            duration: start.elapsed(),
            error,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn classify(
    result: Result<anyhow::Result<()>, Box<dyn Any + Send>>,
) -> Option<IterationError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(IterationError::Failed(format!("{:#}", err))),
        Err(payload) => Some(IterationError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Sleepy {
        work: Duration,
    }

    #[async_trait]
    impl Workload for Sleepy {
        async fn iteration(&self, ctx: &mut VuContext) -> anyhow::Result<()> {
            tokio::time::sleep(self.work).await;
            ctx.check("slept", true);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Workload for Failing {
        async fn iteration(&self, ctx: &mut VuContext) -> anyhow::Result<()> {
            ctx.check("reached", true);
            bail!("backend returned garbage")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Workload for Panicking {
        async fn iteration(&self, _ctx: &mut VuContext) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    struct Requests;

    #[async_trait]
    impl Workload for Requests {
        async fn iteration(&self, ctx: &mut VuContext) -> anyhow::Result<()> {
            ctx.record_request(RequestSample {
                name: "home".to_string(),
                method: "GET".to_string(),
                status: Some(200),
                duration: Duration::from_millis(40),
                waiting: Duration::from_millis(30),
                receiving: Duration::from_millis(10),
                sent: 100,
                received: 2_000,
                failed: false,
            });
            ctx.record_request(RequestSample {
                name: "login".to_string(),
                method: "POST".to_string(),
                status: Some(503),
                duration: Duration::from_millis(80),
                waiting: Duration::from_millis(75),
                receiving: Duration::from_millis(5),
                sent: 300,
                received: 50,
                failed: true,
            });
            ctx.add_counter("logins", 1.0);
            Ok(())
        }

        fn custom_metrics(&self) -> Vec<(String, MetricKind)> {
            vec![("logins".to_string(), MetricKind::Counter)]
        }
    }

    fn executor(workload: impl Workload, settings: IterationSettings) -> Executor {
        let mut registry = MetricsRegistry::new(4);
        for (name, kind) in workload.custom_metrics() {
            registry.register(&name, kind).unwrap();
        }
        registry.mark_started();
        Executor::new(Arc::new(workload), Arc::new(registry), settings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_iteration_is_recorded() {
        let exec = executor(
            Sleepy {
                work: Duration::from_millis(50),
            },
            IterationSettings::default(),
        );
        let mut ctx = VuContext::new(1, exec.metrics().clone());
        let outcome = exec.execute_iteration(&mut ctx).await;
        assert!(outcome.success());
        assert!(outcome.duration >= Duration::from_millis(50));
        assert!(outcome.duration < Duration::from_millis(52));
        ctx.flush(&outcome);

        let snap = exec.metrics().snapshot();
        assert_eq!(snap.get(names::ITERATIONS).unwrap().count(), 1.0);
        assert_eq!(snap.get(names::ITERATION_FAILED).unwrap().rate(), 0.0);
        assert!((snap.get(names::ITERATION_DURATION).unwrap().max() - 50.0).abs() < 1.0);
        assert_eq!(snap.checks["slept"].passes, 1);
    }

    #[tokio::test]
    async fn test_error_is_a_failed_iteration() {
        let exec = executor(Failing, IterationSettings::default());
        let mut ctx = VuContext::new(0, exec.metrics().clone());
        let outcome = exec.execute_iteration(&mut ctx).await;
        assert!(matches!(
            outcome.error,
            Some(IterationError::Failed(ref msg)) if msg.contains("garbage")
        ));
        ctx.flush(&outcome);

        let snap = exec.metrics().snapshot();
        assert_eq!(snap.get(names::ITERATION_FAILED).unwrap().rate(), 1.0);
        // checks made before the failure still count
        assert_eq!(snap.checks["reached"].passes, 1);
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let exec = executor(Panicking, IterationSettings::default());
        let mut ctx = VuContext::new(0, exec.metrics().clone());
        let outcome = exec.execute_iteration(&mut ctx).await;
        assert_eq!(
            outcome.error,
            Some(IterationError::Panicked("boom".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_timeout() {
        let exec = executor(
            Sleepy {
                work: Duration::from_secs(10),
            },
            IterationSettings {
                iteration_timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        let mut ctx = VuContext::new(0, exec.metrics().clone());
        let outcome = exec.execute_iteration(&mut ctx).await;
        assert_eq!(
            outcome.error,
            Some(IterationError::TimedOut(Duration::from_secs(1)))
        );
        assert!(outcome.duration >= Duration::from_secs(1));
        assert!(outcome.duration < Duration::from_millis(1_002));
    }

    #[tokio::test]
    async fn test_requests_feed_http_metrics() {
        let exec = executor(Requests, IterationSettings::default());
        let mut ctx = VuContext::new(3, exec.metrics().clone());
        let outcome = exec.execute_iteration(&mut ctx).await;
        ctx.flush(&outcome);

        let snap = exec.metrics().snapshot();
        assert_eq!(snap.get(names::HTTP_REQS).unwrap().count(), 2.0);
        assert_eq!(snap.get(names::HTTP_REQ_FAILED).unwrap().rate(), 0.5);
        assert_eq!(snap.get(names::DATA_SENT).unwrap().count(), 400.0);
        assert_eq!(snap.get(names::DATA_RECEIVED).unwrap().count(), 2_050.0);
        assert_eq!(snap.get("logins").unwrap().count(), 1.0);
        let waiting = snap.get(names::HTTP_REQ_WAITING).unwrap();
        assert_eq!(waiting.samples(), 2);
        assert_eq!(waiting.max(), 75.0);
        assert_eq!(snap.get(names::HTTP_REQ_RECEIVING).unwrap().min(), 5.0);
    }

    #[test]
    fn test_request_tags() {
        let sample = RequestSample {
            name: "home".to_string(),
            method: "GET".to_string(),
            status: None,
            failed: true,
            ..Default::default()
        };
        let tags = sample.tags();
        assert_eq!(tags["status"], "0");
        assert_eq!(tags["expected_response"], "false");
        assert_eq!(tags["name"], "home");
    }

    #[test]
    fn test_delay_after() {
        let settings = IterationSettings {
            pacing: Duration::from_secs(1),
            min_iteration_duration: Some(Duration::from_millis(500)),
            iteration_timeout: None,
        };
        assert_eq!(
            settings.delay_after(Duration::from_millis(200)),
            Duration::from_millis(1_300)
        );
        assert_eq!(
            settings.delay_after(Duration::from_secs(2)),
            Duration::from_secs(1)
        );
        assert_eq!(
            IterationSettings::default().delay_after(Duration::from_millis(5)),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_interrupts_pacing_sleep() {
        let exec = Arc::new(executor(
            Sleepy {
                work: Duration::from_millis(10),
            },
            IterationSettings {
                pacing: Duration::from_secs(60),
                ..Default::default()
            },
        ));
        let vu = Arc::new(VirtualUser::new(7));
        let retire = CancellationToken::new();

        let task = {
            let exec = exec.clone();
            let vu = vu.clone();
            let retire = retire.clone();
            tokio::spawn(async move { exec.run_vu(vu, retire).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(vu.state(), VuState::Idle);
        let before = Instant::now();
        retire.cancel();
        task.await.unwrap();

        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(vu.iterations(), 1);
        assert_eq!(vu.state(), VuState::Retired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_lets_iteration_finish() {
        let exec = Arc::new(executor(
            Sleepy {
                work: Duration::from_secs(5),
            },
            IterationSettings::default(),
        ));
        let vu = Arc::new(VirtualUser::new(1));
        let retire = CancellationToken::new();

        let task = {
            let exec = exec.clone();
            let vu = vu.clone();
            let retire = retire.clone();
            tokio::spawn(async move { exec.run_vu(vu, retire).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(vu.state(), VuState::Running);
        retire.cancel();
        task.await.unwrap();

        assert_eq!(vu.iterations(), 1);
        let snap = exec.metrics().snapshot();
        assert_eq!(snap.get(names::ITERATIONS).unwrap().count(), 1.0);
        let failed = snap.get(names::ITERATION_FAILED).unwrap();
        assert_eq!(failed.samples(), 1);
        assert_eq!(failed.rate(), 0.0);
    }
}
