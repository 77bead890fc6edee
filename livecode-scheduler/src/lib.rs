//! # livecode-scheduler
//!
//! A fixed pool of worker threads draining a single bounded FIFO of tasks.
//! Its features are:
//!
//! - One worker per physical core, configurable through [`Builder`]
//! - Backpressure: submitting into a full queue blocks instead of growing it
//! - Task trees: a task only finishes once its own body and every child
//!   attached to it have finished
//! - Waiting threads help: [`Scheduler::wait_for_task`] executes queued work
//!   while the awaited task is outstanding
//!
//! # Basic Usage
//!
//! ```rust
//! use livecode_scheduler::Scheduler;
//!
//! let scheduler = Scheduler::build().threads(2).finish();
//!
//! // An empty root acts as a join point for the real work.
//! let root = scheduler.create_empty_task();
//! let children: Vec<_> = (1..=4)
//!     .map(|n| {
//!         let child = scheduler.create_child_task(&root, move || n * n);
//!         scheduler.run_task(&child);
//!         child
//!     })
//!     .collect();
//!
//! scheduler.run_task(&root);
//! scheduler.wait_for_task(&root);
//!
//! let total: i32 = children.iter().filter_map(|child| child.result()).sum();
//! assert_eq!(total, 30);
//!
//! scheduler.destroy_tasks(&children).unwrap();
//! scheduler.destroy_task(&root).unwrap();
//! ```
//!
//! # Shutting down
//!
//! [`Scheduler::shutdown`] returns immediately, closes the queue to new work,
//! and leaves the workers parked on it until the process exits.
//! [`Scheduler::shutdown_gracefully`] sends every worker a stop request and
//! joins it. Either way, tasks submitted afterwards still run, on the threads
//! that submit or wait for them.
use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::queue::{Slot, TaskQueue};
use crate::task::{QueuedTask, TaskArena};

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod queue;
pub mod sync;
mod task;
pub mod topology;

pub use task::{TaskHandle, TaskId, TaskRef};

/// The stack reserved for each worker thread unless configured otherwise.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// How long a waiting thread sleeps when it finds no work to help with.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Configures and starts a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct Builder {
    threads: usize,
    queue_capacity: usize,
    thread_name: Option<String>,
    thread_stack_size: usize,
    wait_interval: Duration,
}

impl Builder {
    /// Returns the default configuration: one worker per physical core and a
    /// queue of [`queue::DEFAULT_CAPACITY`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: topology::physical_core_count(),
            queue_capacity: queue::DEFAULT_CAPACITY,
            thread_name: None,
            thread_stack_size: DEFAULT_STACK_SIZE,
            wait_interval: DEFAULT_WAIT_INTERVAL,
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Zero is allowed: queued tasks are then only executed by threads
    /// blocked in [`Scheduler::wait_for_task`].
    #[must_use]
    pub fn threads(mut self, thread_count: usize) -> Self {
        self.threads = thread_count;
        self
    }

    /// Sets the number of queue slots. Must be a power of two.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the prefix of worker thread names. Workers are named
    /// `"{name}-{index}"`.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Sets the stack size of each worker thread, in bytes.
    #[must_use]
    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Sets how long [`Scheduler::wait_for_task`] sleeps when it finds no
    /// queued work to help with.
    #[must_use]
    pub fn wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Creates the queue and spawns the workers.
    ///
    /// # Panics
    ///
    /// Panics if the queue capacity is not a power of two or a worker thread
    /// cannot be spawned.
    #[must_use]
    pub fn finish(self) -> Scheduler {
        let shared = Arc::new(Shared {
            queue: TaskQueue::new(self.queue_capacity),
            tasks: TaskArena::default(),
        });

        let thread_name = self
            .thread_name
            .unwrap_or_else(|| String::from("livecode-worker"));

        let mut workers = Vec::with_capacity(self.threads);
        for index in 0..self.threads {
            let shared = shared.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("{thread_name}-{index}"))
                    .stack_size(self.thread_stack_size)
                    .spawn(move || run_worker(index, &shared))
                    .expect("error spawning worker thread"),
            );
        }
        debug!(
            workers = self.threads,
            capacity = self.queue_capacity,
            "scheduler started"
        );

        Scheduler {
            data: Arc::new(SchedulerData {
                shared,
                live_workers: AtomicUsize::new(workers.len()),
                workers: Mutex::new(workers),
                shut_down: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                wait_interval: self.wait_interval,
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// State reachable from worker threads. Workers keep it alive for as long as
// they run, which after a fast shutdown is until the process exits.
struct Shared {
    queue: TaskQueue<QueuedTask>,
    tasks: TaskArena,
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn run_worker(index: usize, shared: &Shared) {
    debug!(worker = index, "worker started");
    while let Slot::Task(task) = shared.queue.pop_task() {
        shared.tasks.execute(task.as_ref());
    }
    debug!(worker = index, "worker stopped");
}

struct SchedulerData {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    // Workers not yet detached or joined.
    live_workers: AtomicUsize,
    shut_down: AtomicBool,
    // Set by a fast shutdown; nothing is queued afterwards.
    closed: AtomicBool,
    wait_interval: Duration,
}

/// A cloneable handle to a worker pool and its task queue.
#[derive(Clone)]
pub struct Scheduler {
    data: Arc<SchedulerData>,
}

impl Scheduler {
    /// Starts a scheduler with the default configuration.
    #[must_use]
    pub fn startup() -> Self {
        Builder::new().finish()
    }

    /// Returns a [`Builder`] to configure a new scheduler.
    #[must_use]
    pub fn build() -> Builder {
        Builder::new()
    }

    /// The number of worker threads still owned by this scheduler.
    ///
    /// Zero after either kind of shutdown.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.data.live_workers.load(Ordering::Acquire)
    }

    /// The number of tasks created and not yet destroyed.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.data.shared.tasks.len()
    }

    /// Creates a task that runs `body` once it is executed.
    ///
    /// The task is not queued until it is passed to [`Self::run_task`].
    pub fn create_task<R, F>(&self, body: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.data.shared.tasks.create::<(), R, F>(None, body)
    }

    /// Creates a task whose completion `parent` waits for.
    ///
    /// `parent` is notified immediately, so it cannot finish before this child
    /// does even if the child is queued much later.
    pub fn create_child_task<P, R, F>(&self, parent: &TaskHandle<P>, body: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.data.shared.tasks.create(Some(parent), body)
    }

    /// Creates a task with no work of its own, useful as a join point for
    /// children.
    pub fn create_empty_task(&self) -> TaskHandle<bool> {
        self.create_task(|| true)
    }

    /// Removes a finished task from the scheduler.
    ///
    /// Fails without removing anything if the task has not finished.
    /// Outstanding [`TaskHandle`]s keep the task's result readable.
    pub fn destroy_task(&self, task: impl TaskRef) -> Result<(), SchedulerError> {
        self.data.shared.tasks.destroy(task.task_id())
    }

    /// Destroys every task in `tasks`, returning the first error encountered.
    ///
    /// Tasks after a failing one are still destroyed.
    pub fn destroy_tasks<I>(&self, tasks: I) -> Result<(), SchedulerError>
    where
        I: IntoIterator,
        I::Item: TaskRef,
    {
        let mut result = Ok(());
        for task in tasks {
            if let Err(err) = self.destroy_task(task) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Queues `task` for execution, blocking while the queue is full.
    ///
    /// Without live workers a full queue is drained by the calling thread
    /// instead, so submitting never waits on a queue nobody consumes. After a
    /// fast [`Self::shutdown`] the queue is closed and `task` executes on the
    /// calling thread before this returns.
    pub fn run_task<R>(&self, task: &TaskHandle<R>)
    where
        R: Send + 'static,
    {
        let shared = &self.data.shared;
        if self.data.closed.load(Ordering::Acquire) {
            debug!(task = ?task.id(), "queue closed; executing task on the caller");
            shared.tasks.execute(task.queued().as_ref());
            return;
        }

        trace!(task = ?task.id(), "queueing task");
        let mut queued = task.queued();
        loop {
            queued = match shared.queue.try_push_task(queued) {
                Ok(()) => return,
                Err(queued) => queued,
            };
            if self.worker_count() > 0 {
                shared.queue.push_task(queued);
                return;
            }

            match shared.queue.try_pop_task() {
                Some(Slot::Task(other)) => shared.tasks.execute(other.as_ref()),
                Some(Slot::Stop) => {
                    trace!("discarding stop request; no workers remain");
                }
                None => thread::yield_now(),
            }
        }
    }

    /// Blocks until `task` has finished.
    ///
    /// While waiting, the calling thread executes other queued tasks itself
    /// and sleeps for the configured wait interval whenever the queue is
    /// empty.
    pub fn wait_for_task<R>(&self, task: &TaskHandle<R>) {
        let shared = &self.data.shared;
        while !task.is_finished() {
            match shared.queue.try_pop_task() {
                Some(Slot::Task(other)) => shared.tasks.execute(other.as_ref()),
                Some(Slot::Stop) => {
                    // Stop requests are meant for workers; hand it back.
                    shared.queue.push_stop();
                    thread::sleep(self.data.wait_interval);
                }
                None => thread::sleep(self.data.wait_interval),
            }
        }
    }

    /// Closes the queue and detaches the worker threads without waiting for
    /// them.
    ///
    /// Tasks already queued may still be picked up by the detached workers or
    /// by [`Self::wait_for_task`]. Nothing is queued afterwards: later calls to
    /// [`Self::run_task`] execute the task on the calling thread, and the
    /// workers stay parked on the empty queue until the process exits.
    pub fn shutdown(&self) {
        if self.begin_shutdown() {
            self.data.closed.store(true, Ordering::Release);
            self.data.live_workers.store(0, Ordering::Release);
            let detached = std::mem::take(&mut *self.data.workers.lock());
            debug!(workers = detached.len(), "scheduler shut down");
            drop(detached);
        }
    }

    /// Asks every worker to stop once the tasks queued ahead of the request
    /// have run, and joins them.
    ///
    /// Returns the panic payload of a worker that did not exit cleanly.
    pub fn shutdown_gracefully(&self) -> Result<(), Box<dyn Any + Send + 'static>> {
        if self.begin_shutdown() {
            let mut workers = self.data.workers.lock();
            for _ in 0..workers.len() {
                self.data.shared.queue.push_stop();
            }
            while let Some(worker) = workers.pop() {
                let joined = worker.join();
                self.data.live_workers.fetch_sub(1, Ordering::AcqRel);
                joined?;
            }
            debug!("scheduler shut down gracefully");
        }

        Ok(())
    }

    fn begin_shutdown(&self) -> bool {
        self.data
            .shut_down
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.data.shared.queue)
            .field("tasks", &self.task_count())
            .field("shut_down", &self.data.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Errors returned when destroying tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// The task was already destroyed.
    UnknownTask(TaskId),
    /// The task or one of its children has not finished executing.
    Unfinished(TaskId),
}

impl Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::UnknownTask(id) => write!(f, "unknown task {id:?}"),
            SchedulerError::Unfinished(id) => write!(f, "task {id:?} has not finished"),
        }
    }
}

impl std::error::Error for SchedulerError {}
