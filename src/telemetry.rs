//! Timing of long-running server operations.

use std::time::{Duration, Instant};

/// Measures a named operation and reports its duration when dropped.
#[derive(Debug)]
#[must_use = "the scope is reported as soon as it is dropped"]
pub struct TimedScope {
    name: &'static str,
    started: Instant,
}

impl TimedScope {
    /// Starts timing the operation called `name`.
    pub fn new(name: &'static str) -> Self {
        trace!(scope = name, "started");
        Self {
            name,
            started: Instant::now(),
        }
    }

    /// The name given to [`Self::new`].
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The time since the scope was started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for TimedScope {
    fn drop(&mut self) {
        info!(
            scope = self.name,
            seconds = self.elapsed().as_secs_f64(),
            "finished"
        );
    }
}
