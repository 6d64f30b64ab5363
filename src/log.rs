//! Logging conventions used throughout the runtime.
//!
//! This crate does not ship its own [`log::Log`] backend — embedding an
//! application picks its own (`env_logger`, `fern`, a structured JSON
//! sink, ...) and calls [`log::set_logger`]. What this module fixes is
//! *which* level and *which* target each kind of runtime event is logged
//! under, so that a consuming application can filter sensibly with
//! `RUST_LOG=corogroup::worker=debug` and the like.
//!
//! Levels:
//! - [`Level::Trace`]: per context switch, per steal attempt. Only useful
//!   when chasing a scheduling bug; expect this to dominate output.
//! - [`Level::Debug`]: worker going to sleep/waking, timer firing, group
//!   construction.
//! - [`Level::Warn`]: a run queue overflowed and the producer is retrying,
//!   or the timer worker's heap service loop fell behind its deadline.
//!   Both are recoverable by design, so they never become an [`Error`].
//!
//! [`Level::Error`] is deliberately unused: every failure mode this crate
//! can hit on its own hot paths either panics (a violated API invariant)
//! or is represented by [`crate::error::Error`] and returned to the
//! caller, who decides whether it's actually an error for them.
//!
//! [`Error`]: log::Level::Error

/// Logging target used for scheduler/worker-loop events.
pub const TARGET_WORKER: &str = "corogroup::worker";

/// Logging target used for the timer subsystem.
pub const TARGET_TIMER: &str = "corogroup::timer";

/// Logging target used for run-queue producer/consumer backpressure.
pub const TARGET_RUN_QUEUE: &str = "corogroup::run_queue";
