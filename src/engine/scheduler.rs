use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::executor::Executor;
use crate::stats::{names, Tags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    Spawned = 0,
    Running = 1,
    Idle = 2,
    Retired = 3,
}

impl VuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VuState::Spawned,
            1 => VuState::Running,
            2 => VuState::Idle,
            _ => VuState::Retired,
        }
    }
}

/// Lock-free view of one VU, shared between its task and the scheduler.
#[derive(Debug)]
pub struct VirtualUser {
    id: usize,
    iterations: AtomicU64,
    state: AtomicU8,
}

impl VirtualUser {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            iterations: AtomicU64::new(0),
            state: AtomicU8::new(VuState::Spawned as u8),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Iterations completed so far.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn complete_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: VuState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

struct VuHandle {
    user: Arc<VirtualUser>,
    retire: CancellationToken,
    join: JoinHandle<()>,
}

struct Retiring {
    handle: VuHandle,
    since: Instant,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: usize,
    pub interrupted: usize,
}

/// Keeps the number of active VUs equal to the stage target.
///
/// Active VUs live on a stack; scaling down retires from the top so the
/// most recently started VUs go first. A retiring VU keeps running until
/// its current iteration ends and is only interrupted when it outlives
/// `graceful_ramp_down`.
pub struct Scheduler {
    executor: Arc<Executor>,
    root: CancellationToken,
    active: Vec<VuHandle>,
    retiring: Vec<Retiring>,
    next_id: usize,
    graceful_ramp_down: Duration,
}

impl Scheduler {
    pub fn new(
        executor: Arc<Executor>,
        root: CancellationToken,
        graceful_ramp_down: Duration,
    ) -> Self {
        Self {
            executor,
            root,
            active: Vec::new(),
            retiring: Vec::new(),
            next_id: 0,
            graceful_ramp_down,
        }
    }

    /// VUs counted toward the target.
    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Active VUs plus retiring ones that have not exited yet.
    pub fn running(&self) -> usize {
        self.active.len() + self.retiring.iter().filter(|r| !r.handle.join.is_finished()).count()
    }

    /// Spawn or retire VUs until `active() == target`.
    pub fn reconcile(&mut self, target: usize) {
        if self.root.is_cancelled() {
            return;
        }
        while self.active.len() < target {
            self.spawn();
        }
        while self.active.len() > target {
            let Some(handle) = self.active.pop() else {
                break;
            };
            debug!(vu = handle.user.id(), "retiring vu");
            handle.retire.cancel();
            self.retiring.push(Retiring {
                handle,
                since: Instant::now(),
            });
        }
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let user = Arc::new(VirtualUser::new(id));
        let retire = self.root.child_token();
        let join = {
            let executor = self.executor.clone();
            let user = user.clone();
            let retire = retire.clone();
            tokio::spawn(async move { executor.run_vu(user, retire).await })
        };
        debug!(vu = id, "spawned vu");
        self.active.push(VuHandle { user, retire, join });
    }

    /// Drop retired VUs that have exited and interrupt the ones that have
    /// been retiring for longer than the ramp-down grace period. Returns the
    /// number interrupted.
    pub fn reap(&mut self) -> usize {
        let grace = self.graceful_ramp_down;
        let mut interrupted = 0;
        let retiring = std::mem::take(&mut self.retiring);
        for r in retiring {
            if r.handle.join.is_finished() {
                continue;
            }
            if r.since.elapsed() >= grace {
                self.interrupt(&r.handle);
                interrupted += 1;
            } else {
                self.retiring.push(r);
            }
        }
        interrupted
    }

    /// Retire everything, wait up to `grace` for in-flight iterations, then
    /// abort whatever is left.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        for handle in self.active.drain(..) {
            handle.retire.cancel();
            self.retiring.push(Retiring {
                handle,
                since: Instant::now(),
            });
        }

        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();
        let retiring = std::mem::take(&mut self.retiring);
        for mut r in retiring {
            match tokio::time::timeout_at(deadline, &mut r.handle.join).await {
                Ok(_) => report.completed += 1,
                Err(_) => {
                    self.interrupt(&r.handle);
                    report.interrupted += 1;
                }
            }
        }

        if report.interrupted > 0 {
            warn!(
                interrupted = report.interrupted,
                grace = ?grace,
                "vus did not finish within the graceful stop period"
            );
        }
        report
    }

    fn interrupt(&self, handle: &VuHandle) {
        let user = &handle.user;
        if user.state() == VuState::Running {
            self.executor
                .metrics()
                .add(user.id(), names::INTERRUPTED_ITERATIONS, 1.0, &Tags::new());
        }
        handle.join.abort();
        user.set_state(VuState::Retired);
        debug!(vu = user.id(), "interrupted vu");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in &self.active {
            handle.join.abort();
        }
        for r in &self.retiring {
            r.handle.join.abort();
        }
    }
}
