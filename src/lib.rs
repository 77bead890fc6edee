//! The concurrency core of a live coding server.
//!
//! - [`scheduler`] runs module loading and other batch work on a pool of
//!   worker threads.
//! - [`sync_point`] pauses instrumented code in watched processes while a
//!   patch is applied.
//! - [`command`] is the per-client command thread that drives both.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod command;
pub mod telemetry;

pub use livecode_scheduler as scheduler;
pub use livecode_sync_point as sync_point;
