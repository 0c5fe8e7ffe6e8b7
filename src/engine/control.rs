use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::stages::StagePlan;
use crate::stats::summary::AbortReason;
use crate::stats::MetricsRegistry;

/// Shared state of one run, handed explicitly to every task that needs it.
pub struct RunContext {
    plan: StagePlan,
    metrics: Arc<MetricsRegistry>,
    /// Cancelling this retires every VU and ends the control loop.
    cancel: CancellationToken,
    abort_reason: Mutex<Option<AbortReason>>,
}

impl RunContext {
    pub fn new(plan: StagePlan, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            plan,
            metrics,
            cancel: CancellationToken::new(),
            abort_reason: Mutex::new(None),
        }
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn elapsed(&self) -> Duration {
        self.metrics.elapsed()
    }

    /// Stop the run. The first reason wins; returns false if the run was
    /// already aborted.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let mut slot = self.abort_reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.cancel.cancel();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.lock().is_some()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason.lock().clone()
    }
}

/// Cloneable handle for stopping a run from outside the engine.
#[derive(Clone)]
pub struct AbortHandle {
    ctx: Arc<RunContext>,
}

impl AbortHandle {
    pub(crate) fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub fn abort(&self) -> bool {
        self.ctx.abort(AbortReason::External)
    }

    pub fn is_aborted(&self) -> bool {
        self.ctx.is_aborted()
    }
}
