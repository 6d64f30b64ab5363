//! The per-OS-thread worker loop: acquire, spin, steal, sleep.
//!
//! Every [`Worker`] owns one slot in a [`SchedulingGroup`] and, once
//! started, never returns control to its caller until the group is
//! stopped — `run` blocks for the lifetime of the worker.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use log::debug;

use crate::fiber;
use crate::group::{AcquireResult, SchedulingGroup};

/// One group this worker may steal from, at a fixed cadence: every
/// `steal_every_n` calls to [`Worker::steal_fiber`].
struct Victim {
    group: Arc<SchedulingGroup>,
    steal_every_n: u64,
}

/// A single worker OS thread. `index` is this worker's slot within `group`
/// (0..group.size()), used for the spinning/sleeping bitmasks.
pub struct Worker {
    group: Arc<SchedulingGroup>,
    index: usize,
    victims: Vec<Victim>,
    /// Min-heap of `(next_steal, victim_index)`, ordered by due time.
    schedule: BinaryHeap<Reverse<(u64, usize)>>,
    clock: u64,
}

impl Worker {
    pub fn new(group: Arc<SchedulingGroup>, index: usize) -> Self {
        Self {
            group,
            index,
            victims: Vec::new(),
            schedule: BinaryHeap::new(),
            clock: 0,
        }
    }

    /// Registers `victim` as stealable at the given cadence. A
    /// `steal_every_n` of zero means "never steal from there" (e.g.
    /// cross-NUMA stealing disabled) and is silently dropped.
    pub fn add_victim(&mut self, victim: Arc<SchedulingGroup>, steal_every_n: u64) {
        if steal_every_n == 0 {
            return;
        }
        let idx = self.victims.len();
        self.victims.push(Victim { group: victim, steal_every_n });
        self.schedule.push(Reverse((0, idx)));
    }

    /// Runs this worker's main loop on the calling OS thread. Blocks until
    /// the group is stopped and the run queue is drained.
    pub fn run(mut self) {
        self.enter_group();

        loop {
            let acquired = match self.group.acquire_fiber() {
                AcquireResult::Fiber(f) => Some(f),
                AcquireResult::Shutdown => break,
                AcquireResult::Empty => None,
            };

            let acquired = match acquired {
                Some(f) => Some(f),
                None => match self.group.spinning_acquire_fiber(self.index) {
                    AcquireResult::Fiber(f) => Some(f),
                    AcquireResult::Shutdown => break,
                    AcquireResult::Empty => None,
                },
            };

            let acquired = acquired.or_else(|| self.steal_fiber());

            let f = match acquired {
                Some(f) => f,
                None => match self.group.wait_for_fiber(self.index) {
                    AcquireResult::Fiber(f) => f,
                    AcquireResult::Shutdown => break,
                    AcquireResult::Empty => {
                        unreachable!("wait_for_fiber only returns once woken or shut down")
                    }
                },
            };

            fiber::run_fiber(f);
        }

        self.leave_group();
    }

    /// First act of the worker loop: registers our native thread handle for
    /// parking, builds the master fiber entity on this OS thread's own
    /// stack, and registers a thread-local timer inbox with the group's
    /// timer worker.
    fn enter_group(&self) {
        self.group.register_worker_thread(self.index);
        fiber::init_master_on_this_thread();
        let inbox = self.group.timer_worker.register_inbox();
        crate::timer::set_current_inbox(inbox);
        debug!(target: crate::log::TARGET_WORKER, "worker {} entered group {}", self.index, self.group.index);
    }

    fn leave_group(&self) {
        debug!(target: crate::log::TARGET_WORKER, "worker {} leaving group {}", self.index, self.group.index);
    }

    /// Bumps this worker's local clock and drains every due victim,
    /// attempting a steal on each and re-queueing it at its cadence. Stops
    /// at the first successful steal rather than continuing to drain —
    /// any victims still due this round remain due on the next call.
    ///
    /// A stolen fiber is reparented to this worker's own group
    /// (`set_owner`) so its next `ready`/resume goes through the local
    /// queue instead of the one it was stolen from.
    fn steal_fiber(&mut self) -> Option<fiber::FiberPtr> {
        self.clock += 1;
        let mut result = None;

        while let Some(&Reverse((due, idx))) = self.schedule.peek() {
            if due > self.clock {
                break;
            }
            self.schedule.pop();
            let steal_every_n = self.victims[idx].steal_every_n;
            self.schedule.push(Reverse((self.clock + steal_every_n, idx)));

            if result.is_some() {
                continue;
            }
            if let Some(f) = self.victims[idx].group.run_queue.steal() {
                self.group.set_owner(f);
                result = Some(f);
                break;
            }
        }

        result
    }
}
