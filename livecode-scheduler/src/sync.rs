//! Blocking primitives shared by the task queue, the command shell, and the
//! sync point.

use std::fmt::Debug;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A non-reentrant mutual exclusion lock that protects a region of code rather
/// than a value.
///
/// Entering returns a [`ScopedLock`]; the section is left when the guard is
/// dropped, which covers early returns and unwinding.
#[derive(Default)]
pub struct CriticalSection {
    lock: Mutex<()>,
}

impl CriticalSection {
    /// Returns a section no thread is inside.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the section is free and enters it.
    pub fn enter(&self) -> ScopedLock<'_> {
        ScopedLock {
            _guard: self.lock.lock(),
        }
    }

    /// Enters the section only if no other thread currently holds it.
    pub fn try_enter(&self) -> Option<ScopedLock<'_>> {
        self.lock.try_lock().map(|guard| ScopedLock { _guard: guard })
    }

    /// Returns true if some thread is currently inside the section.
    #[must_use]
    pub fn is_entered(&self) -> bool {
        self.lock.is_locked()
    }
}

impl Debug for CriticalSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriticalSection")
            .field("entered", &self.is_entered())
            .finish()
    }
}

/// Proof of being inside a [`CriticalSection`].
#[must_use = "the critical section is left as soon as the lock is dropped"]
pub struct ScopedLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl ScopedLock<'_> {
    /// Leaves the critical section before the end of the scope.
    pub fn leave(self) {}
}

/// A counting semaphore with an upper bound.
///
/// The count never exceeds `maximum`. Signalling a semaphore that is already
/// at its maximum is reported and otherwise ignored.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
    maximum: usize,
}

impl Semaphore {
    /// Returns a semaphore holding `initial` of at most `maximum` counts.
    ///
    /// # Panics
    ///
    /// Panics if `initial` exceeds `maximum`.
    #[must_use]
    pub fn new(initial: usize, maximum: usize) -> Self {
        assert!(
            initial <= maximum,
            "initial semaphore count {initial} exceeds the maximum {maximum}"
        );
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
            maximum,
        }
    }

    /// A semaphore that is either signalled or not.
    #[must_use]
    pub fn binary() -> Self {
        Self::new(0, 1)
    }

    /// Increments the count by one, waking a single waiter.
    ///
    /// Returns false without changing anything if the count is already at its
    /// maximum.
    pub fn signal(&self) -> bool {
        let mut count = self.count.lock();
        if *count >= self.maximum {
            drop(count);
            error!(maximum = self.maximum, "semaphore signalled past its maximum count");
            return false;
        }
        *count += 1;
        drop(count);
        self.available.notify_one();
        true
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Decrements the count if it is positive, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            false
        } else {
            *count -= 1;
            true
        }
    }

    /// The current count.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// The highest count this semaphore can reach.
    #[must_use]
    pub const fn maximum(&self) -> usize {
        self.maximum
    }
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut f = f.debug_struct("Semaphore");
        if let Some(count) = self.count.try_lock() {
            f.field("count", &*count);
        }
        f.field("maximum", &self.maximum).finish()
    }
}
