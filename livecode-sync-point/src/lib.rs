//! # livecode-sync-point
//!
//! A rendezvous between a server that needs a watched process to hold still,
//! for example while code in it is being patched, and the instrumented code
//! running inside that process.
//!
//! The watched side calls [`SyncPoint::entry`] from a point where it is safe to
//! be paused. The first call arms the sync point; there is no other
//! registration. The server brackets its unsafe work with
//! [`SyncPoint::enter`] and [`SyncPoint::leave`]:
//!
//! ```rust
//! use livecode_sync_point::SyncPoint;
//!
//! let sync_point = SyncPoint::new();
//!
//! // Nothing has ever reached the entry point, so there is nobody to wait for
//! // and the server does not block.
//! assert!(!sync_point.enter());
//! sync_point.leave();
//!
//! // Without a pending request, the entry point never blocks either.
//! sync_point.entry();
//! assert!(sync_point.is_used());
//! ```
//!
//! # Arming race
//!
//! Arming is lazy. A server calling [`SyncPoint::enter`] while the watched
//! code is in the middle of its very first [`SyncPoint::entry`] call may see
//! the sync point unarmed and skip the rendezvous. Only once one entry call
//! has completed is every later `enter`/`leave` pair guaranteed to bracket a
//! region in which the watched code is parked. The `leave` matching a skipped
//! `enter` releases nothing, so a skipped rendezvous never lets a later one
//! pass straight through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use livecode_scheduler::sync::Semaphore;

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

/// Rendezvous state shared by a server and the watched code it pauses.
#[derive(Debug)]
pub struct SyncPoint {
    is_used: AtomicBool,
    // True between an `enter` that parked the watched code and its `leave`.
    parked: AtomicBool,
    // Signalled by the server to ask the watched code to park.
    requested: Semaphore,
    // Signalled by the watched code once it is parked.
    entered: Semaphore,
    // Signalled by the server to release the parked code.
    released: Semaphore,
}

impl SyncPoint {
    /// Returns an unarmed sync point with no pending request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_used: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            requested: Semaphore::binary(),
            entered: Semaphore::binary(),
            released: Semaphore::binary(),
        }
    }

    /// The process-wide sync point used by [`sync_point_entry`].
    pub fn global() -> &'static SyncPoint {
        static GLOBAL: OnceLock<SyncPoint> = OnceLock::new();
        GLOBAL.get_or_init(SyncPoint::new)
    }

    /// Returns true once watched code has reached [`Self::entry`] at least
    /// once.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Acquire)
    }

    /// Called by watched code at a point where it may safely be paused.
    ///
    /// Arms the sync point, then parks until the server calls
    /// [`Self::leave`] if the server has asked for a pause. Returns
    /// immediately otherwise.
    pub fn entry(&self) {
        if !self.is_used.swap(true, Ordering::AcqRel) {
            debug!("sync point armed");
        }

        if self.requested.try_wait() {
            trace!("watched code parking at sync point");
            self.entered.signal();
            self.released.wait();
            trace!("watched code resumed");
        }
    }

    /// Asks the watched code to park and blocks until it has.
    ///
    /// Returns false without blocking if the sync point was never armed;
    /// there is no one to synchronize with.
    pub fn enter(&self) -> bool {
        if !self.is_used() {
            return false;
        }

        self.requested.signal();
        self.entered.wait();
        self.parked.store(true, Ordering::Release);
        debug!("watched code parked; entering controlled section");
        true
    }

    /// Releases watched code parked by [`Self::enter`].
    ///
    /// Does nothing unless the last `enter` actually parked the watched code.
    /// In particular, a `leave` paired with an `enter` that returned false
    /// stays a no-op even if the sync point was armed in between.
    pub fn leave(&self) {
        if !self.parked.swap(false, Ordering::AcqRel) {
            trace!("no parked code to release");
            return;
        }

        debug!("leaving controlled section");
        self.released.signal();
    }

    /// Enters the controlled section until the returned guard is dropped.
    pub fn pause(&self) -> Paused<'_> {
        let synchronized = self.enter();
        Paused {
            sync_point: self,
            synchronized,
        }
    }
}

impl Default for SyncPoint {
    fn default() -> Self {
        Self::new()
    }
}

/// A controlled section entered through [`SyncPoint::pause`].
#[must_use = "the watched code resumes as soon as this guard is dropped"]
#[derive(Debug)]
pub struct Paused<'a> {
    sync_point: &'a SyncPoint,
    synchronized: bool,
}

impl Paused<'_> {
    /// Returns true if watched code is parked for the lifetime of this guard.
    #[must_use]
    pub const fn synchronized(&self) -> bool {
        self.synchronized
    }
}

impl Drop for Paused<'_> {
    fn drop(&mut self) {
        if self.synchronized {
            self.sync_point.leave();
        }
    }
}

/// The entry point instrumented code calls, backed by [`SyncPoint::global`].
pub fn sync_point_entry() {
    SyncPoint::global().entry();
}

#[cfg(test)]
mod tests;
