//! # Scheduler
//!
//! Cron-driven loop around a [`RunExecutor`], plus manual "run now".
//!
//! Mutual exclusion lives in [`ScheduleState`]: a run may only start after
//! winning a compare-and-set on the in-progress flag, and the flag is
//! released by dropping the [`RunGuard`], whatever way the run ends. A fire
//! or manual request that loses the race is skipped, never queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::model::RunTrigger;
use super::orchestrator::RunExecutor;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-lifetime scheduling state. Never persisted.
#[derive(Debug, Default)]
pub struct ScheduleState {
    run_in_progress: AtomicBool,
    next_fire: Mutex<Option<DateTime<Utc>>>,
}

impl ScheduleState {
    /// Claims the run slot. `None` when a run is already in progress.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunGuard> {
        self.run_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                state: Arc::clone(self),
            })
    }

    pub fn is_run_in_progress(&self) -> bool {
        self.run_in_progress.load(Ordering::Acquire)
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        *lock(&self.next_fire)
    }

    fn set_next_fire(&self, at: Option<DateTime<Utc>>) {
        *lock(&self.next_fire) = at;
    }
}

/// Holds the run slot; releases it on drop.
#[derive(Debug)]
pub struct RunGuard {
    state: Arc<ScheduleState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.run_in_progress.store(false, Ordering::Release);
    }
}

struct LoopHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything the background loop needs, cloned out of the [`Scheduler`].
#[derive(Clone)]
struct LoopContext {
    executor: Arc<dyn RunExecutor>,
    schedule: cron::Schedule,
    backoff: Duration,
    state: Arc<ScheduleState>,
    shutdown: CancellationToken,
}

impl LoopContext {
    async fn run(self, stop: CancellationToken) {
        info!("Scheduler loop started");
        loop {
            let Some(next) = self.schedule.after(&Local::now()).next() else {
                warn!("Cron expression has no upcoming fire time, scheduler loop exits");
                break;
            };
            self.state.set_next_fire(Some(next.with_timezone(&Utc)));
            info!("Next scheduled run at {}", next);

            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = sleep(wait) => {}
            }

            let Some(guard) = self.state.try_acquire() else {
                info!("A run is already in progress, skipping scheduled fire");
                continue;
            };
            let outcome = self.executor.execute(RunTrigger::Scheduled, &self.shutdown).await;
            drop(guard);

            if let Err(e) = outcome {
                error!("Scheduled run failed: {}. Backing off {:?}", e, self.backoff);
                self.state.set_next_fire(None);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = sleep(self.backoff) => {}
                }
            }
        }
        self.state.set_next_fire(None);
        info!("Scheduler loop stopped");
    }
}

/// # Scheduler
///
/// Owns the background loop and manual runs. Runs receive the process-wide
/// shutdown token; stopping the loop only stops the waiting, a run already
/// started finishes normally.
pub struct Scheduler {
    ctx: LoopContext,
    running_loop: Mutex<Option<LoopHandle>>,
    manual_run: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn RunExecutor>,
        schedule: cron::Schedule,
        backoff: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx: LoopContext {
                executor,
                schedule,
                backoff,
                state: Arc::new(ScheduleState::default()),
                shutdown,
            },
            running_loop: Mutex::new(None),
            manual_run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<ScheduleState> {
        &self.ctx.state
    }

    /// Starts the background loop. `false` when it is already running or
    /// the process is shutting down.
    pub fn start(&self) -> bool {
        if self.ctx.shutdown.is_cancelled() {
            return false;
        }
        let mut slot = lock(&self.running_loop);
        if slot.as_ref().is_some_and(Self::loop_alive) {
            return false;
        }
        let stop = self.ctx.shutdown.child_token();
        let task = tokio::spawn(self.ctx.clone().run(stop.clone()));
        *slot = Some(LoopHandle { stop, task });
        true
    }

    /// Stops the background loop. `false` when it was not running.
    pub fn stop(&self) -> bool {
        match lock(&self.running_loop).take() {
            Some(handle) if Self::loop_alive(&handle) => {
                handle.stop.cancel();
                info!("Scheduler stop requested");
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running_loop)
            .as_ref()
            .is_some_and(Self::loop_alive)
    }

    fn loop_alive(handle: &LoopHandle) -> bool {
        !handle.stop.is_cancelled() && !handle.task.is_finished()
    }

    /// Starts a manual run in the background. `false` when a run is in
    /// progress; the request is not queued.
    pub fn run_now(&self) -> bool {
        let Some(guard) = self.ctx.state.try_acquire() else {
            info!("Manual run rejected: a run is already in progress");
            return false;
        };
        let executor = Arc::clone(&self.ctx.executor);
        let shutdown = self.ctx.shutdown.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            match executor.execute(RunTrigger::Manual, &shutdown).await {
                Ok(run) => info!(
                    "Manual run finished: {} endpoints, {} unlocked",
                    run.summary().total,
                    run.summary().unlocked()
                ),
                Err(e) => error!("Manual run failed: {}", e),
            }
        });
        *lock(&self.manual_run) = Some(task);
        true
    }

    /// Waits up to `limit` for the loop and any manual run to finish.
    /// Callers cancel the shutdown token first. Returns `false` on timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let loop_task = lock(&self.running_loop).take().map(|h| h.task);
        let manual_task = lock(&self.manual_run).take();
        let state = Arc::clone(&self.ctx.state);

        timeout(limit, async move {
            if let Some(task) = loop_task {
                let _ = task.await;
            }
            if let Some(task) = manual_task {
                let _ = task.await;
            }
            while state.is_run_in_progress() {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok()
    }
}
