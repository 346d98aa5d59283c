//! Single-threaded task scheduler
//!
//! One worker thread runs delayed and repeated tasks in deadline order. Tasks
//! scheduled for the same instant run in the order they were scheduled.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{LocalError, Result};

/// Deadline used for delays too large to represent
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Work item run by the [`Timer`]
pub trait TimerTask: Send + Sync {
    fn run_timer_task(&self);
}

impl<F> TimerTask for F
where
    F: Fn() + Send + Sync,
{
    fn run_timer_task(&self) {
        self()
    }
}

/// Identifies a scheduled task for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Token {
    id: u64,
    period: Option<Duration>,
    task: Arc<dyn TimerTask>,
}

#[derive(Default)]
struct TimerState {
    /// Pending tasks ordered by (deadline, insertion id)
    queue: BTreeMap<(Instant, u64), Token>,
    /// Deadline of every live task. Repeated tasks stay here while running.
    tasks: HashMap<u64, Instant>,
    /// Deadline the worker sleeps until, `None` when idle
    wake_up: Option<Instant>,
    next_id: u64,
    destroyed: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

pub struct Timer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Timer {
    /// Start the worker thread
    pub fn new(thread_name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || run(worker_shared))
            .map_err(|e| LocalError::Initialization(format!("cannot start timer thread: {}", e)))?;

        Ok(Self {
            shared,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Run `task` once after `delay`
    pub fn schedule(&self, task: Arc<dyn TimerTask>, delay: Duration) -> Result<TimerHandle> {
        self.insert(task, delay, None)
    }

    /// Run `task` every `period`, measured from the end of each run
    pub fn schedule_repeated(&self, task: Arc<dyn TimerTask>, period: Duration) -> Result<TimerHandle> {
        self.insert(task, period, Some(period))
    }

    fn insert(
        &self,
        task: Arc<dyn TimerTask>,
        delay: Duration,
        period: Option<Duration>,
    ) -> Result<TimerHandle> {
        let mut state = self.shared.state.lock();
        if state.destroyed {
            return Err(LocalError::CommunicatorDestroyed);
        }

        let id = state.next_id;
        state.next_id += 1;
        let deadline = deadline_after(delay);
        state.tasks.insert(id, deadline);
        state.queue.insert((deadline, id), Token { id, period, task });

        if state.wake_up.map_or(true, |w| deadline < w) {
            self.shared.cond.notify_one();
        }
        Ok(TimerHandle(id))
    }

    /// Cancel a pending task. Returns false if the task already ran, was
    /// never scheduled, or the timer is destroyed.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.shared.state.lock();
        if state.destroyed {
            return false;
        }
        match state.tasks.remove(&handle.0) {
            Some(deadline) => {
                state.queue.remove(&(deadline, handle.0));
                true
            }
            None => false,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    /// Stop the worker and drop every pending task. No task runs once this
    /// returns, except when called from a task on the timer thread itself.
    pub fn destroy(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.queue.clear();
            state.tasks.clear();
            self.shared.cond.notify_all();
        }

        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("timer thread terminated abnormally");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run(shared: Arc<Shared>) {
    let mut last: Option<Token> = None;
    loop {
        let token = {
            let mut state = shared.state.lock();

            if let Some(done) = last.take() {
                if let Some(period) = done.period {
                    if !state.destroyed && state.tasks.contains_key(&done.id) {
                        let deadline = deadline_after(period);
                        state.tasks.insert(done.id, deadline);
                        state.queue.insert((deadline, done.id), done);
                    }
                }
            }

            loop {
                if state.destroyed {
                    debug!("timer thread exiting");
                    return;
                }

                let first = state.queue.keys().next().copied();
                match first {
                    None => {
                        state.wake_up = None;
                        shared.cond.wait(&mut state);
                    }
                    Some(key) => {
                        let (deadline, id) = key;
                        if deadline <= Instant::now() {
                            let token = match state.queue.remove(&key) {
                                Some(token) => token,
                                None => continue,
                            };
                            if token.period.is_none() {
                                state.tasks.remove(&id);
                            }
                            break token;
                        }
                        state.wake_up = Some(deadline);
                        shared.cond.wait_until(&mut state, deadline);
                    }
                }
            }
        };

        let task = Arc::clone(&token.task);
        if catch_unwind(AssertUnwindSafe(|| task.run_timer_task())).is_err() {
            error!("unexpected exception from task run method in timer thread");
        }
        last = Some(token);
    }
}
