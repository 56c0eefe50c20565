//! Deferred-task execution used by the batcher for flush timers and
//! network calls.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::error;

/// Unit of deferred work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs batcher work off the caller's stack.
///
/// Both methods must return without running `task` inline; the batcher
/// relies on that to keep `queue` and `prefetch_many` non-blocking. A task
/// dropped without running settles its own waiters with fallbacks.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task);
    /// Runs `task` as soon as possible.
    fn spawn(&self, task: Task);
}

/// Scheduler backed by a tokio runtime.
///
/// Timers are tokio sleeps; the tasks themselves do blocking HTTP and run on
/// the runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime of the calling context, if there is one.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(join_error) = tokio::task::spawn_blocking(task).await {
                error!("Scheduled batch task failed: {}", join_error);
            }
        });
    }

    fn spawn(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }
}

#[derive(Default)]
struct ManualQueue {
    timers: Vec<(Duration, Task)>,
    spawned: Vec<Task>,
}

/// Scheduler that only records tasks; the owner decides when they run.
///
/// Used to drive flushes deterministically, and by hosts that pump their own
/// event loop.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<ManualQueue>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualQueue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of armed timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Number of spawned tasks that have not run yet.
    pub fn pending_spawned(&self) -> usize {
        self.lock().spawned.len()
    }

    /// Delays of the armed timers, in arming order.
    pub fn timer_delays(&self) -> Vec<Duration> {
        self.lock().timers.iter().map(|(delay, _)| *delay).collect()
    }

    /// Runs every spawned task queued so far. Returns how many ran.
    pub fn run_spawned(&self) -> usize {
        let tasks = std::mem::take(&mut self.lock().spawned);
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    /// Fires every timer armed so far, regardless of delay. Returns how many fired.
    pub fn fire_timers(&self) -> usize {
        let timers = std::mem::take(&mut self.lock().timers);
        let count = timers.len();
        for (_, task) in timers {
            task();
        }
        count
    }

    /// Runs spawned tasks and fires timers until nothing is left, including
    /// work queued by the tasks themselves. Returns the total number run.
    pub fn run_all(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.run_spawned() + self.fire_timers();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.lock().timers.push((delay, task));
    }

    fn spawn(&self, task: Task) {
        self.lock().spawned.push(task);
    }
}
