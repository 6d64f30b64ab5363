//! Runtime bootstrap: lays scheduling groups out over NUMA nodes, wires
//! inter-group stealing, and owns the start/stop lifecycle. This is the
//! one piece of process-wide mutable state in the crate — everything else
//! is reached through a [`crate::fiber::FiberPtr`] or an
//! [`std::sync::Arc`] handed around explicitly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle as ThreadJoinHandle};

use log::{debug, info};
use once_cell::sync::Lazy;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::fiber::{self, FiberAttr, JoinHandle, LaunchPolicy, SchedulingGroupSelector};
use crate::group::{self, SchedulingGroup};
use crate::timer::TimerWorker;
use crate::topology::Topology;
use crate::worker::Worker;

struct Runtime {
    config: RuntimeConfig,
    topology: Topology,
    groups: Vec<Arc<SchedulingGroup>>,
    fiber_worker_threads: Mutex<Vec<ThreadJoinHandle<()>>>,
    next_group: AtomicUsize,
}

static CURRENT: Lazy<Mutex<Option<Arc<Runtime>>>> = Lazy::new(|| Mutex::new(None));

impl Runtime {
    fn build(config: RuntimeConfig, topology: Topology) -> Self {
        let (group_count, group_size) = resolve_layout(&config, &topology);
        let nodes = topology.nodes();
        let node_count = nodes.len().max(1);

        let groups = (0..group_count)
            .map(|index| {
                let numa_node = nodes.get(index % node_count).map(|n| n.id).unwrap_or(0);
                let timer_worker = TimerWorker::new(group_size);
                SchedulingGroup::new(index, numa_node, group_size, config.fiber_run_queue_size, timer_worker)
            })
            .collect();

        Self {
            config,
            topology,
            groups,
            fiber_worker_threads: Mutex::new(Vec::new()),
            next_group: AtomicUsize::new(0),
        }
    }

    /// Construction order per the bootstrap contract: start every timer
    /// worker first (their `run` loops block on their startup latch until
    /// every fiber worker in the group has registered an inbox), then
    /// every fiber worker.
    fn start(self: &Arc<Self>) {
        for group in &self.groups {
            group.timer_worker.start();
        }

        let mut global_index = 0usize;
        let mut handles = Vec::new();
        for group in &self.groups {
            let victims = self.victims_for(group);
            for worker_index in 0..group.size() {
                let group = Arc::clone(group);
                let victims = victims.clone();
                let cpu = self.cpu_for(global_index);
                global_index += 1;

                let handle = thread::Builder::new()
                    .name(format!("corogroup-w{}-{}", group.index, worker_index))
                    .spawn(move || {
                        if let Some(cpu) = cpu {
                            pin_current_thread_to_cpu(cpu);
                        }
                        let mut worker = Worker::new(Arc::clone(&group), worker_index);
                        for (victim, cadence) in victims {
                            worker.add_victim(victim, cadence);
                        }
                        worker.run();
                    })
                    .expect("failed to spawn fiber worker thread");
                handles.push(handle);
            }
        }
        info!(target: crate::log::TARGET_WORKER, "runtime started: {} groups, {} workers", self.groups.len(), global_index);
        *self.fiber_worker_threads.lock().unwrap() = handles;
    }

    /// Every other group sharing this group's NUMA node is a victim at
    /// `work_stealing_ratio`; every group in a different node is a victim
    /// at `cross_numa_work_stealing_ratio` if NUMA awareness is on (a
    /// cadence of 0, the default, disables it).
    fn victims_for(&self, group: &Arc<SchedulingGroup>) -> Vec<(Arc<SchedulingGroup>, u64)> {
        self.groups
            .iter()
            .filter(|other| !Arc::ptr_eq(other, group))
            .map(|other| {
                let cadence = if other.numa_node == group.numa_node {
                    self.config.work_stealing_ratio
                } else if self.config.numa_aware {
                    self.config.cross_numa_work_stealing_ratio
                } else {
                    0
                };
                (Arc::clone(other), cadence)
            })
            .collect()
    }

    fn allowed_cpus(&self) -> Vec<usize> {
        let mut cpus: Vec<usize> = self.topology.nodes().iter().flat_map(|n| n.cpus.iter().copied()).collect();
        if let Some(only) = &self.config.fiber_worker_accessible_cpus {
            cpus.retain(|c| only.0.contains(c));
        }
        if let Some(exclude) = &self.config.fiber_worker_inaccessible_cpus {
            cpus.retain(|c| !exclude.0.contains(c));
        }
        cpus
    }

    /// Fills in `attr.stack_size`/`attr.guard_page` from
    /// `fiber_stack_size`/`fiber_stack_enable_guard_page` wherever the
    /// caller left them unset, so config §6's two stack-shaping options
    /// actually reach fibers spawned with a plain `FiberAttr::default()`.
    fn resolve_stack_attrs(&self, mut attr: FiberAttr) -> FiberAttr {
        attr.stack_size.get_or_insert(self.config.fiber_stack_size);
        attr.guard_page.get_or_insert(self.config.fiber_stack_enable_guard_page);
        attr
    }

    fn cpu_for(&self, global_worker_index: usize) -> Option<usize> {
        if !self.config.fiber_worker_disallow_cpu_migration {
            return None;
        }
        let cpus = self.allowed_cpus();
        if cpus.is_empty() {
            return None;
        }
        Some(cpus[global_worker_index % cpus.len()])
    }

    /// Shutdown order per the bootstrap contract: stop every group, then
    /// every timer worker, then join fiber workers, then join timer
    /// workers — a timer callback may `ready` a fiber while the run queue
    /// is still draining, so the timer worker must outlive that drain, but
    /// must be joined before anything it could reference is torn down.
    fn stop_and_join(&self) {
        for group in &self.groups {
            group.stop();
        }
        for group in &self.groups {
            group.timer_worker.stop();
        }
        let handles = std::mem::take(&mut *self.fiber_worker_threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        for group in &self.groups {
            group.timer_worker.join();
        }
        debug!(target: crate::log::TARGET_WORKER, "runtime stopped");
    }
}

fn resolve_layout(config: &RuntimeConfig, topology: &Topology) -> (usize, usize) {
    let group_size = config.workers_per_group.unwrap_or(config.scheduling_group_size);
    let concurrency = if config.concurrency_hint == 0 {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        config.concurrency_hint
    };

    let mut group_count = config
        .scheduling_groups
        .unwrap_or_else(|| (concurrency + group_size - 1) / group_size.max(1));
    group_count = group_count.max(1);

    if config.numa_aware {
        let node_count = topology.node_count().max(1);
        group_count = ((group_count + node_count - 1) / node_count) * node_count;
    }

    (group_count, group_size)
}

#[cfg(target_os = "linux")]
fn pin_current_thread_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread_to_cpu(_cpu: usize) {}

fn current_runtime() -> Arc<Runtime> {
    CURRENT.lock().unwrap().clone().expect("no runtime is currently running; call start_runtime first")
}

/// Validates `config`, lays out scheduling groups over `topology`, and
/// starts every worker and timer thread. Only one runtime may be running
/// per process at a time.
///
/// # Panics
/// Panics if a runtime is already running.
pub fn start_runtime(config: RuntimeConfig, topology: Topology) -> Result<()> {
    config.validate()?;
    let runtime = Arc::new(Runtime::build(config, topology));
    runtime.start();

    let mut slot = CURRENT.lock().unwrap();
    assert!(slot.is_none(), "start_runtime called while a runtime is already running");
    *slot = Some(runtime);
    Ok(())
}

/// Stops every scheduling group and timer worker and joins every worker
/// thread, in the order the bootstrap contract requires. Blocks until
/// every worker has drained its queue and exited.
///
/// # Panics
/// Panics if no runtime is currently running.
pub fn terminate_runtime() {
    let runtime = CURRENT
        .lock()
        .unwrap()
        .take()
        .expect("terminate_runtime called without a running runtime");
    runtime.stop_and_join();
}

pub fn get_scheduling_group_count() -> usize {
    current_runtime().groups.len()
}

pub fn get_scheduling_group_size(index: usize) -> usize {
    current_runtime().groups[index].size()
}

/// # Panics
/// Panics outside of fiber context.
pub fn get_current_scheduling_group_index() -> usize {
    group::current_group().index
}

pub fn get_scheduling_group_assigned_node(index: usize) -> usize {
    current_runtime().groups[index].numa_node
}

fn resolve_group(selector: SchedulingGroupSelector, runtime: &Runtime) -> Arc<SchedulingGroup> {
    match selector {
        SchedulingGroupSelector::Index(i) => Arc::clone(&runtime.groups[i]),
        SchedulingGroupSelector::Nearest => {
            if fiber::is_in_fiber_context() {
                let current = group::current_group();
                runtime
                    .groups
                    .iter()
                    .find(|g| g.numa_node == current.numa_node)
                    .map(Arc::clone)
                    .unwrap_or(current)
            } else {
                Arc::clone(&runtime.groups[0])
            }
        }
        SchedulingGroupSelector::Unspecified => {
            let idx = runtime.next_group.fetch_add(1, Ordering::Relaxed) % runtime.groups.len();
            Arc::clone(&runtime.groups[idx])
        }
    }
}

/// Spawns a new fiber per `attr` and returns a handle to join (or detach)
/// it. With `LaunchPolicy::Post` (the default) the fiber is enqueued and
/// the caller keeps running; with `LaunchPolicy::Dispatch` the calling
/// worker switches onto it immediately.
///
/// # Panics
/// Panics if `attr.launch_policy` is `Dispatch` and the resolved target
/// group is not the calling fiber's own group — this combination is
/// rejected rather than given an unspecified meaning (see `DESIGN.md`).
pub fn start_fiber<T: Send + 'static>(attr: FiberAttr, entry: impl FnOnce() -> T + Send + 'static) -> Result<JoinHandle<T>> {
    let runtime = current_runtime();
    let target_group = resolve_group(attr.scheduling_group, &runtime);
    let attr = runtime.resolve_stack_attrs(attr);
    let (f, handle) = fiber::build_joinable(&attr, entry)?;

    match attr.launch_policy {
        LaunchPolicy::Post => {
            target_group.ready_fiber(f, false);
        }
        LaunchPolicy::Dispatch => {
            let current = fiber::current();
            assert!(!current.is_null(), "Launch::Dispatch requires a current fiber context");
            let current_group = group::group_of(current);
            assert!(
                Arc::ptr_eq(&current_group, &target_group),
                "Launch::Dispatch requires the new fiber's scheduling group to equal the caller's"
            );
            target_group.set_owner(f);
            current_group.switch_to(current, f);
        }
    }
    Ok(handle)
}

/// Spawns a fiber to run `entry`, detached from the moment it starts: the
/// convenience form of `start_fiber(..).map(JoinHandle::detach)` for
/// callers that will never join it, grounded in the same `{ launch_policy,
/// scheduling_group }` attribute bundle as `start_fiber`.
///
/// # Panics
/// Same as [`start_fiber`].
pub fn start_fiber_from_pthread(entry: impl FnOnce() + Send + 'static) -> Result<()> {
    start_fiber(FiberAttr::default(), entry)?.detach();
    Ok(())
}

/// Spawns a batch of fibers, all sharing `attr`, as a single all-or-nothing
/// enqueue plus one wake-up rather than one push per fiber.
///
/// # Panics
/// Panics if the batch is larger than the target group's free run queue
/// capacity — callers spawning more fibers than the queue holds should
/// split the batch themselves.
pub fn batch_start_fibers<T: Send + 'static>(
    attr: &FiberAttr,
    entries: Vec<Box<dyn FnOnce() -> T + Send>>,
) -> Result<Vec<JoinHandle<T>>> {
    let runtime = current_runtime();
    let target_group = resolve_group(attr.scheduling_group, &runtime);
    let attr = runtime.resolve_stack_attrs(attr.clone());

    let mut fibers = Vec::with_capacity(entries.len());
    let mut handles = Vec::with_capacity(entries.len());
    for entry in entries {
        let (f, handle) = fiber::build_joinable(&attr, entry)?;
        fibers.push(f);
        handles.push(handle);
    }

    let ok = target_group.batch_ready(&fibers);
    assert!(ok, "batch_start_fibers: run queue has insufficient free capacity for {} fibers", fibers.len());
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_layout_honors_explicit_group_count() {
        let config = RuntimeConfig::new().with_concurrency_hint(4).with_scheduling_groups(3).with_numa_aware(false);
        let topology = Topology::uniform(4);
        let (groups, _) = resolve_layout(&config, &topology);
        assert_eq!(groups, 3);
    }

    #[test]
    fn resolve_layout_derives_from_concurrency() {
        let config = RuntimeConfig::new()
            .with_concurrency_hint(32)
            .with_scheduling_group_size(8)
            .with_numa_aware(false);
        let topology = Topology::uniform(32);
        let (groups, size) = resolve_layout(&config, &topology);
        assert_eq!(groups, 4);
        assert_eq!(size, 8);
    }

    #[test]
    fn resolve_layout_rounds_up_to_numa_node_count() {
        let config = RuntimeConfig::new()
            .with_concurrency_hint(10)
            .with_scheduling_group_size(8)
            .with_numa_aware(true);
        let topology = Topology::new(vec![
            crate::topology::NumaNode::new(0, (0..8).collect()),
            crate::topology::NumaNode::new(1, (8..16).collect()),
        ]);
        let (groups, _) = resolve_layout(&config, &topology);
        assert_eq!(groups % 2, 0);
    }
}
