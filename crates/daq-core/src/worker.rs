//! WorkerQueue - FIFO task queue served by one dedicated thread.
//!
//! Driver hooks that must not block (e.g. the read-interrupt hook, which runs
//! with the port lock held) hand blocking work to a [`WorkerQueue`].
//!
//! Tasks are identified by *object identity*, not content: a [`WorkerTask`] is
//! a cheap clone of a shared handle, and the same handle can be queued at most
//! once at a time. Once it has been taken off the queue to run, it can be
//! submitted again.
//!
//! ```rust,ignore
//! let worker = WorkerQueue::spawn("sim-interrupt")?;
//! let task = WorkerTask::new("abort-dma", move || hardware.abort());
//!
//! assert!(worker.submit(&task));
//! assert!(!worker.submit(&task)); // already queued
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::AppResult;

struct TaskInner {
    name: String,
    run: Box<dyn Fn() + Send + Sync>,
}

/// A unit of work that can be submitted to a [`WorkerQueue`] repeatedly.
#[derive(Clone)]
pub struct WorkerTask {
    inner: Arc<TaskInner>,
}

impl WorkerTask {
    pub fn new(name: impl Into<String>, run: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                run: Box::new(run),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn same_task(&self, other: &WorkerTask) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTask")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<WorkerTask>,
    stop: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

/// A task queue with its own thread.
///
/// Dropping the queue stops the thread and joins it. A task that is already
/// running is allowed to finish; tasks still queued are discarded.
pub struct WorkerQueue {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl WorkerQueue {
    /// Start the worker thread.
    pub fn spawn(name: impl Into<String>) -> AppResult<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(&thread_shared))?;
        let thread_id = handle.thread().id();
        debug!(worker = %name, "Worker thread started");

        Ok(Self {
            name,
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task. Returns `false` if this task is already queued or the
    /// queue has been stopped.
    pub fn submit(&self, task: &WorkerTask) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.stop {
                warn!(worker = %self.name, task = task.name(), "Task submitted to stopped worker");
                return false;
            }
            if state.queue.iter().any(|queued| queued.same_task(task)) {
                trace!(worker = %self.name, task = task.name(), "Task already queued");
                return false;
            }
            state.queue.push_back(task.clone());
        }
        self.shared.wakeup.notify_one();
        true
    }

    /// Remove a task if it is still queued. Returns `false` if it was not
    /// queued (never submitted, already running or finished).
    pub fn cancel(&self, task: &WorkerTask) -> bool {
        let mut state = self.shared.state.lock();
        match state.queue.iter().position(|queued| queued.same_task(task)) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stop the thread and wait for it to exit. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            state.queue.clear();
        }
        self.shared.wakeup.notify_all();

        // A task stopping its own worker cannot join itself.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "Worker thread panicked");
            }
            debug!(worker = %self.name, "Worker thread stopped");
        }
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_worker(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.stop {
            break;
        }
        let Some(task) = state.queue.pop_front() else {
            shared.wakeup.wait(&mut state);
            continue;
        };

        // Run with the queue unlocked so the task can resubmit itself.
        parking_lot::MutexGuard::unlocked(&mut state, || {
            trace!(task = task.name(), "Running worker task");
            (task.inner.run)();
        });
    }
}
