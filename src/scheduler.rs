//! Repeating-task scheduler for the background workers.
//!
//! Each task runs in its own tokio task. First fire is jittered to
//! avoid a thundering herd at startup; later fires are measured from
//! the start of the previous fire, so intervals do not drift with task
//! runtime. A task that fails three times in a row is marked degraded
//! and runs at double its interval until a success resets it.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Failures in a row before a task is considered degraded.
const DEGRADED_AFTER: u32 = 3;

/// Clonable cancellation token. Workers check it between database
/// round-trips and wait on it in their select loops.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Self { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub type TaskFn = Arc<dyn Fn(Shutdown) -> BoxFuture<'static, color_eyre::Result<()>> + Send + Sync>;

pub struct TaskSpec {
    pub name: &'static str,
    pub interval: Duration,
    pub jitter_frac: f64,
    pub task: TaskFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    NeverRan,
    Ok,
    Failed,
}

/// Per-worker status snapshot for `Upholder::status()`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: &'static str,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: TaskOutcome,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

struct TaskState {
    spec: TaskSpec,
    in_flight: AtomicBool,
    trigger: Notify,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
    last_outcome: Mutex<TaskOutcome>,
}

pub struct Scheduler {
    tasks: Mutex<Vec<Arc<TaskState>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Shutdown,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Registers a repeating task. Must be called before `start`.
    pub fn schedule(&self, spec: TaskSpec) {
        let state = Arc::new(TaskState {
            spec,
            in_flight: AtomicBool::new(false),
            trigger: Notify::new(),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            last_run_at: Mutex::new(None),
            last_outcome: Mutex::new(TaskOutcome::NeverRan),
        });
        lock(&self.tasks).push(state);
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = lock(&self.tasks).clone();
        let mut handles = lock(&self.handles);
        for state in tasks {
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(run_task(state, shutdown)));
        }
        info!(workers = handles.len(), "scheduler started");
    }

    /// Waits up to `timeout` for workers to observe cancellation; any
    /// stragglers are abandoned. The caller is responsible for
    /// signalling the shutdown token first.
    pub async fn stop(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.handles));
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!("scheduler stop timed out; abandoning in-flight workers");
        }
        self.started.store(false, Ordering::SeqCst);
    }

    /// Forces an out-of-band run. A trigger while that task is already
    /// in flight is coalesced (dropped, not queued).
    pub fn trigger_now(&self, name: &str) {
        let tasks = lock(&self.tasks);
        let Some(state) = tasks.iter().find(|t| t.spec.name == name) else {
            debug!(task = name, "trigger for unknown task ignored");
            return;
        };
        if state.in_flight.load(Ordering::Acquire) {
            debug!(task = name, "trigger coalesced with in-flight run");
            return;
        }
        state.trigger.notify_one();
    }

    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        lock(&self.tasks)
            .iter()
            .map(|t| WorkerStatus {
                name: t.spec.name,
                last_run_at: *lock(&t.last_run_at),
                last_outcome: *lock(&t.last_outcome),
                consecutive_failures: t.consecutive_failures.load(Ordering::Relaxed),
                degraded: t.degraded.load(Ordering::Relaxed),
            })
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn run_task(state: Arc<TaskState>, shutdown: Shutdown) {
    let name = state.spec.name;
    let interval = state.spec.interval;

    let initial_delay = {
        let jitter = state.spec.jitter_frac.clamp(0.0, 1.0);
        interval.mul_f64(rand::rng().random_range(0.0..=1.0) * jitter)
    };
    let mut next_fire = Instant::now() + initial_delay;

    loop {
        let mut wait_shutdown = shutdown.clone();
        tokio::select! {
            _ = wait_shutdown.cancelled() => break,
            _ = state.trigger.notified() => {}
            _ = tokio::time::sleep_until(next_fire) => {}
        }
        if shutdown.is_cancelled() {
            break;
        }

        let fire_start = Instant::now();
        state.in_flight.store(true, Ordering::Release);
        let result = (state.spec.task)(shutdown.clone()).await;
        state.in_flight.store(false, Ordering::Release);

        *lock(&state.last_run_at) = Some(Utc::now());
        match result {
            Ok(()) => {
                *lock(&state.last_outcome) = TaskOutcome::Ok;
                state.consecutive_failures.store(0, Ordering::Relaxed);
                if state.degraded.swap(false, Ordering::Relaxed) {
                    info!(task = name, "task recovered from degraded state");
                }
            }
            Err(e) => {
                *lock(&state.last_outcome) = TaskOutcome::Failed;
                let failures = state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(task = name, failures, error = %e, "scheduled task failed");
                if failures >= DEGRADED_AFTER && !state.degraded.swap(true, Ordering::Relaxed) {
                    warn!(task = name, "task marked degraded, doubling interval");
                }
            }
        }

        let effective = if state.degraded.load(Ordering::Relaxed) {
            interval * 2
        } else {
            interval
        };
        // Drift-free schedule from fire start; if the run overran the
        // interval, fire once immediately rather than catching up.
        next_fire = fire_start + effective;
        let now = Instant::now();
        if next_fire < now {
            next_fire = now;
        }
    }
    debug!(task = name, "worker exited");
}
