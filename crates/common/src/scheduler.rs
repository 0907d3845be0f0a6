//! Task scheduling on dedicated threads.
//!
//! Every [`Scheduler`] owns exactly one OS thread. A task that blocks only
//! delays its own schedule, and [`Scheduler::stop`] halts only that schedule.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to spawn scheduler thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Once {
        delay: Duration,
    },
    Periodic {
        initial_delay: Duration,
        interval: Duration,
    },
    Repeated {
        delay: Duration,
        cycles: u64,
    },
}

pub struct SchedulerBuilder {
    name: String,
}

impl SchedulerBuilder {
    /// Runs `task` exactly once after `delay`.
    pub fn after<F>(self, delay: Duration, task: F) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        Scheduler::start(self.name, Schedule::Once { delay }, task)
    }

    /// Runs `task` every `interval`, the first time after one interval.
    pub fn periodically<F>(self, interval: Duration, task: F) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        self.periodically_after(interval, interval, task)
    }

    pub fn periodically_after<F>(
        self,
        initial_delay: Duration,
        interval: Duration,
        task: F,
    ) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        Scheduler::start(
            self.name,
            Schedule::Periodic {
                initial_delay,
                interval,
            },
            task,
        )
    }

    /// Runs `task` `cycles` times, waiting `delay` before each run, then stops by itself.
    pub fn repeated<F>(self, delay: Duration, cycles: u64, task: F) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        Scheduler::start(self.name, Schedule::Repeated { delay, cycles }, task)
    }
}

pub struct Scheduler {
    name: String,
    stop_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    executions: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn builder(name: impl Into<String>) -> SchedulerBuilder {
        SchedulerBuilder { name: name.into() }
    }

    pub fn after<F>(delay: Duration, task: F) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        Self::builder("scheduler").after(delay, task)
    }

    pub fn periodically<F>(interval: Duration, task: F) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        Self::builder("scheduler").periodically(interval, task)
    }

    pub fn periodically_after<F>(
        initial_delay: Duration,
        interval: Duration,
        task: F,
    ) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        Self::builder("scheduler").periodically_after(initial_delay, interval, task)
    }

    pub fn repeated<F>(delay: Duration, cycles: u64, task: F) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        Self::builder("scheduler").repeated(delay, cycles, task)
    }

    fn start<F>(name: String, schedule: Schedule, task: F) -> SchedulerResult<Scheduler>
    where
        F: FnMut() + Send + 'static,
    {
        // The thread keeps its own sender so dropping the Scheduler detaches instead of stopping.
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let thread_stop_tx = stop_tx.clone();
        let executions = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            name: name.clone(),
            stop_rx,
            _stop_tx: thread_stop_tx,
            executions: Arc::clone(&executions),
            finished: Arc::clone(&finished),
        };

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run(schedule, task))
            .map_err(|source| SchedulerError::Spawn {
                name: name.clone(),
                source,
            })?;

        debug!("Scheduler {} started with {:?}", name, schedule);

        Ok(Scheduler {
            name,
            thread_id: handle.thread().id(),
            stop_tx,
            handle: Mutex::new(Some(handle)),
            executions,
            finished,
        })
    }

    /// Stops the schedule and waits for its thread to exit. Calling it again is a no-op.
    ///
    /// When called from inside the scheduled task the thread cannot be joined. The
    /// schedule still ends as soon as the task returns.
    pub fn stop(&self) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        // Full means a stop signal is already queued.
        let _ = self.stop_tx.try_send(());

        if thread::current().id() == self.thread_id {
            return;
        }

        if handle.join().is_err() {
            error!("Scheduler {} thread terminated abnormally", self.name);
        }
        debug!("Scheduler {} stopped", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// True once the schedule will never run its task again.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst) || self.handle.lock().is_none()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("executions", &self.execution_count())
            .finish()
    }
}

struct Worker {
    name: String,
    stop_rx: Receiver<()>,
    _stop_tx: Sender<()>,
    executions: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
}

impl Worker {
    fn run<F: FnMut()>(self, schedule: Schedule, mut task: F) {
        match schedule {
            Schedule::Once { delay } => {
                if self.wait(delay) {
                    self.execute(&mut task);
                }
            }
            Schedule::Periodic {
                initial_delay,
                interval,
            } => {
                let mut delay = initial_delay;
                while self.wait(delay) {
                    self.execute(&mut task);
                    delay = interval;
                }
            }
            Schedule::Repeated { delay, cycles } => {
                for _ in 0..cycles {
                    if !self.wait(delay) {
                        break;
                    }
                    self.execute(&mut task);
                }
            }
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Returns false if a stop was requested while waiting.
    fn wait(&self, delay: Duration) -> bool {
        match self.stop_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn execute<F: FnMut()>(&self, task: &mut F) {
        // A stop that races with the timer wins.
        if !self.stop_rx.is_empty() {
            return;
        }
        if panic::catch_unwind(AssertUnwindSafe(|| task())).is_err() {
            error!("Task of scheduler {} panicked", self.name);
        }
        self.executions.fetch_add(1, Ordering::SeqCst);
    }
}
