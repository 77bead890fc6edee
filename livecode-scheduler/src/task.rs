use std::any::Any;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use alot::{LotId, Lots};
use parking_lot::Mutex;

use crate::SchedulerError;

/// A stable handle to a task stored in a scheduler's arena.
///
/// Ids are generational: once a task is destroyed its id never resolves again,
/// even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(LotId);

/// Anything that identifies a task.
pub trait TaskRef {
    /// Returns the id of the referenced task.
    fn task_id(&self) -> TaskId;
}

impl TaskRef for TaskId {
    fn task_id(&self) -> TaskId {
        *self
    }
}

impl<R> TaskRef for TaskHandle<R> {
    fn task_id(&self) -> TaskId {
        self.id
    }
}

impl<T> TaskRef for &T
where
    T: TaskRef + ?Sized,
{
    fn task_id(&self) -> TaskId {
        T::task_id(self)
    }
}

/// Completion bookkeeping shared by every task.
///
/// `open` starts at one for the task's own body and gains one per attached
/// child. The task is finished once it drops back to zero.
pub(crate) struct TaskCore {
    parent: Option<TaskId>,
    open: Mutex<usize>,
}

impl TaskCore {
    fn new(parent: Option<TaskId>) -> Self {
        Self {
            parent,
            open: Mutex::new(1),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.open.lock() == 0
    }

    fn on_child_attach(&self) {
        *self.open.lock() += 1;
    }

    // Returns true if this release finished the task.
    fn release(&self) -> bool {
        let mut open = self.open.lock();
        let Some(remaining) = open.checked_sub(1) else {
            drop(open);
            error!("released a task that was already finished");
            return false;
        };
        *open = remaining;
        remaining == 0
    }
}

/// Type-erased view of a task, as stored in the arena and the queue.
pub(crate) trait Body: Send + Sync + 'static {
    fn core(&self) -> &TaskCore;

    // Runs the body; false if it had already run.
    fn run(&self) -> bool;
}

pub(crate) type QueuedTask = Arc<dyn Body>;

type BoxedBody<R> = Box<dyn FnOnce() -> R + Send + 'static>;

pub(crate) struct TaskCell<R> {
    core: TaskCore,
    body: Mutex<Option<BoxedBody<R>>>,
    result: Mutex<Option<R>>,
}

impl<R> Body for TaskCell<R>
where
    R: Send + 'static,
{
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(&self) -> bool {
        let Some(body) = self.body.lock().take() else {
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => *self.result.lock() = Some(result),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "task body panicked; completing without a result");
            }
        }
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// A typed, cloneable handle to a task producing an `R`.
pub struct TaskHandle<R> {
    id: TaskId,
    cell: Arc<TaskCell<R>>,
}

impl<R> TaskHandle<R> {
    /// The arena id of this task.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns true once the body has run and every attached child has
    /// finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cell.core.is_finished()
    }

    /// Moves the body's result out of the task.
    ///
    /// Returns `None` if the body has not run yet, if it panicked, or if the
    /// result was already taken. Reading before [`Self::is_finished`] is true
    /// only observes the task's own body, not its children.
    pub fn take_result(&self) -> Option<R> {
        self.cell.result.lock().take()
    }
}

impl<R> TaskHandle<R>
where
    R: Send + 'static,
{
    pub(crate) fn queued(&self) -> QueuedTask {
        self.cell.clone()
    }
}

impl<R> TaskHandle<R>
where
    R: Clone + Send + 'static,
{
    /// Returns a copy of the body's result, if it has run.
    #[must_use]
    pub fn result(&self) -> Option<R> {
        self.cell.result.lock().clone()
    }
}

impl<R> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
        }
    }
}

impl<R> Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut f = f.debug_struct("TaskHandle");
        f.field("id", &self.id);
        if let Some(open) = self.cell.core.open.try_lock() {
            f.field("open", &*open);
        }
        f.finish()
    }
}

/// Owns every live task of a scheduler.
///
/// Parents are referenced by [`TaskId`] and only resolved for the duration of
/// a completion notification; the arena is the sole owner.
#[derive(Default)]
pub(crate) struct TaskArena {
    tasks: Mutex<Lots<QueuedTask>>,
}

impl TaskArena {
    pub(crate) fn create<P, R, F>(&self, parent: Option<&TaskHandle<P>>, body: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        // The parent must count this child before the child can possibly be
        // queued, or the parent could be observed finished too early.
        let parent_id = parent.map(|parent| {
            parent.cell.core.on_child_attach();
            parent.id
        });

        let cell = Arc::new(TaskCell {
            core: TaskCore::new(parent_id),
            body: Mutex::new(Some(Box::new(body))),
            result: Mutex::new(None),
        });
        let id = TaskId(self.tasks.lock().push(cell.clone()));
        trace!(task = ?id, parent = ?parent_id, "created task");
        TaskHandle { id, cell }
    }

    fn get(&self, id: TaskId) -> Option<QueuedTask> {
        self.tasks.lock().get(id.0).cloned()
    }

    pub(crate) fn destroy(&self, id: TaskId) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock();
        let finished = tasks
            .get(id.0)
            .ok_or(SchedulerError::UnknownTask(id))?
            .core()
            .is_finished();
        if !finished {
            return Err(SchedulerError::Unfinished(id));
        }

        let task = tasks.remove(id.0);
        drop(tasks);
        // Results are dropped outside of the arena lock.
        drop(task);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Runs `task`'s body and propagates completion up its ancestors.
    pub(crate) fn execute(&self, task: &dyn Body) {
        if !task.run() {
            error!("task executed more than once");
            return;
        }
        if !task.core().release() {
            return;
        }

        let mut parent = task.core().parent;
        while let Some(id) = parent {
            // Resolve the parent only for this notification. The arena lock
            // is released before touching the parent's own counter.
            let Some(task) = self.get(id) else {
                error!(parent = ?id, "finished child refers to a destroyed parent");
                return;
            };
            if !task.core().release() {
                return;
            }
            trace!(task = ?id, "parent finished with its last child");
            parent = task.core().parent;
        }
    }
}
