//! Monotonic time source used by the timer subsystem and by fiber sleeps.
//!
//! The runtime never reads the wall clock on its scheduling hot paths —
//! [`std::time::Instant`] is cheap to sample (typically a single `vDSO`
//! call) and immune to clock adjustments, which matters because a backward
//! jump in wall-clock time would make a min-heap of deadlines misbehave.

use std::time::{Duration, Instant};

/// A duration long enough to stand in for "no deadline" without needing a
/// separate `Option` branch on every comparison in the timer heap.
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Returns the current instant, as read by the runtime's clock source.
///
/// This is a thin wrapper around [`Instant::now`] rather than a direct
/// call to it so that every deadline computation in this crate goes
/// through one place.
#[inline(always)]
pub fn now() -> Instant {
    Instant::now()
}

/// Computes a deadline `timeout` from now, saturating instead of
/// overflowing if `timeout` is absurdly large (e.g. [`INFINITY`]).
#[inline(always)]
pub fn deadline_after(timeout: Duration) -> Instant {
    now().checked_add(timeout).unwrap_or_else(|| now() + INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_after_is_in_the_future() {
        let d = deadline_after(Duration::from_millis(10));
        assert!(d > now());
    }

    #[test]
    fn deadline_after_saturates() {
        let d = deadline_after(INFINITY);
        assert!(d > now());
    }
}
