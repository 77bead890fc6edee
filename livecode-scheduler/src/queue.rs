//! A fixed-capacity, multi-producer multi-consumer FIFO of pending work.
//!
//! The queue never grows. A producer pushing into a full queue blocks until a
//! consumer frees a slot, which throttles producers to the rate at which the
//! worker pool drains the queue.

use std::fmt::Debug;

use parking_lot::Mutex;

use crate::sync::Semaphore;

/// The number of slots a scheduler's queue has unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 1024;

/// An entry popped from a [`TaskQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<T> {
    /// Work to execute.
    Task(T),
    /// A request for the consuming worker to exit its loop.
    Stop,
}

impl<T> Slot<T> {
    /// Returns the task, or `None` for a stop request.
    pub fn into_task(self) -> Option<T> {
        match self {
            Slot::Task(task) => Some(task),
            Slot::Stop => None,
        }
    }
}

/// A bounded FIFO of [`Slot`]s shared by producers and worker threads.
pub struct TaskQueue<T> {
    ring: Mutex<Ring<T>>,
    // Counts empty slots; producers wait on it.
    free: Semaphore,
    // Counts filled slots; consumers wait on it.
    occupied: Semaphore,
    mask: u64,
}

struct Ring<T> {
    slots: Box<[Option<Slot<T>>]>,
    read: u64,
    write: u64,
}

impl<T> Ring<T> {
    #[allow(clippy::cast_possible_truncation)]
    fn slot_index(index: u64, mask: u64) -> usize {
        // The mask is derived from a usize capacity, so this never truncates.
        (index & mask) as usize
    }
}

impl<T> TaskQueue<T> {
    /// Returns a queue with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "task queue capacity must be a power of two, got {capacity}"
        );
        let slots = std::iter::repeat_with(|| None).take(capacity).collect();
        Self {
            ring: Mutex::new(Ring {
                slots,
                read: 0,
                write: 0,
            }),
            free: Semaphore::new(capacity, capacity),
            occupied: Semaphore::new(0, capacity),
            mask: capacity as u64 - 1,
        }
    }

    /// The fixed number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    /// The number of entries pushed but not yet popped.
    #[must_use]
    pub fn len(&self) -> usize {
        let ring = self.ring.lock();
        usize::try_from(ring.write - ring.read).expect("bounded by capacity")
    }

    /// Returns true if nothing is waiting to be popped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `task`, blocking while the queue is full.
    pub fn push_task(&self, task: T) {
        self.push(Slot::Task(task));
    }

    /// Appends a stop request, blocking while the queue is full.
    pub fn push_stop(&self) {
        self.push(Slot::Stop);
    }

    /// Appends `task` if a slot is free, handing it back otherwise.
    pub fn try_push_task(&self, task: T) -> Result<(), T> {
        if self.free.try_wait() {
            self.write(Slot::Task(task));
            Ok(())
        } else {
            Err(task)
        }
    }

    fn push(&self, slot: Slot<T>) {
        self.free.wait();
        self.write(slot);
    }

    // Callers must have claimed a free slot first.
    fn write(&self, slot: Slot<T>) {
        let mut ring = self.ring.lock();
        let index = Ring::<T>::slot_index(ring.write, self.mask);
        debug_assert!(ring.slots[index].is_none(), "overwriting a queued slot");
        ring.slots[index] = Some(slot);
        ring.write += 1;
        trace!(write = ring.write, "pushed to task queue");
        drop(ring);

        self.occupied.signal();
    }

    /// Removes the oldest entry, blocking while the queue is empty.
    pub fn pop_task(&self) -> Slot<T> {
        self.occupied.wait();
        self.take_oldest()
    }

    /// Removes the oldest entry if one is ready, without blocking.
    pub fn try_pop_task(&self) -> Option<Slot<T>> {
        if self.occupied.try_wait() {
            Some(self.take_oldest())
        } else {
            None
        }
    }

    // Callers must have claimed an occupied slot first.
    fn take_oldest(&self) -> Slot<T> {
        let mut ring = self.ring.lock();
        let index = Ring::<T>::slot_index(ring.read, self.mask);
        let slot = ring.slots[index]
            .take()
            .expect("occupied semaphore guarantees a filled slot");
        ring.read += 1;
        trace!(read = ring.read, "popped from task queue");
        drop(ring);

        self.free.signal();
        slot
    }
}

impl<T> Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut f = f.debug_struct("TaskQueue");
        if let Some(ring) = self.ring.try_lock() {
            f.field("read", &ring.read)
                .field("write", &ring.write)
                .field("capacity", &ring.slots.len());
        }
        f.finish_non_exhaustive()
    }
}
