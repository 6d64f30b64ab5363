//! End-to-end scenarios exercising the whole stack through its public
//! surface: a runtime is started, a handful of fibers run against it, and
//! the runtime is torn down again. Each test grabs `TEST_LOCK` first since
//! only one runtime may run per process at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use corogroup::config::RuntimeConfig;
use corogroup::fiber::{self, FiberAttr};
use corogroup::runtime;
use corogroup::sync::{Cond, Latch, Mutex};
use corogroup::timer;
use corogroup::topology::Topology;

static TEST_LOCK: Lazy<StdMutex<()>> = Lazy::new(|| StdMutex::new(()));

/// Starts a runtime, runs `body` to completion on a dedicated root fiber,
/// returns whatever `body` returns, and tears the runtime back down.
/// `body` itself runs in fiber context, so it may freely spawn, join, lock
/// and wait on any of this crate's primitives.
fn run_on_runtime<F, R>(config: RuntimeConfig, topology: Topology, body: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let _guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    runtime::start_runtime(config, topology).expect("start_runtime");
    let (tx, rx) = std::sync::mpsc::channel();
    runtime::start_fiber(FiberAttr::default(), move || {
        let _ = tx.send(body());
    })
    .expect("start_fiber")
    .detach();
    let result = rx.recv().expect("root fiber dropped its result channel");
    runtime::terminate_runtime();
    result
}

fn small_group_config() -> RuntimeConfig {
    RuntimeConfig::new().with_scheduling_groups(1).with_workers_per_group(4).with_numa_aware(false)
}

/// Scenario A: 2 groups of 4 workers each, a run queue of 1024 slots, and
/// 100,000 fibers each bumping a shared counter once and exiting. The
/// queue is far smaller than the fiber count, so spawning also exercises
/// `ready_fiber`'s retry-on-full path.
#[test]
fn scenario_a_mass_fiber_launch() {
    let config = RuntimeConfig::new()
        .with_scheduling_groups(2)
        .with_workers_per_group(4)
        .with_numa_aware(false)
        .with_fiber_run_queue_size(1024);

    let total = run_on_runtime(config, Topology::uniform(8), || {
        const FIBER_COUNT: usize = 100_000;
        let counter = Arc::new(AtomicU64::new(0));
        let done = Latch::new(FIBER_COUNT);
        let attr = FiberAttr {
            stack_size: Some(16 * 1024),
            guard_page: Some(false),
            ..FiberAttr::default()
        };

        for _ in 0..FIBER_COUNT {
            let counter = Arc::clone(&counter);
            let done = done.clone();
            runtime::start_fiber(attr.clone(), move || {
                counter.fetch_add(1, Ordering::Relaxed);
                done.count_down();
            })
            .expect("start_fiber")
            .detach();
        }

        done.wait();
        counter.load(Ordering::Relaxed)
    });

    assert_eq!(total, 100_000);
}

/// Scenario B: two fibers contending for the same `Mutex`-guarded
/// non-atomic counter, each incrementing it 100,000 times. Mutual
/// exclusion alone (no atomics anywhere) must still land on exactly
/// double the per-fiber count.
#[test]
fn scenario_b_mutex_excludes_concurrent_increments() {
    const ITERATIONS: u64 = 1_000_000;

    let total = run_on_runtime(small_group_config(), Topology::uniform(4), || {
        let counter = Arc::new(Mutex::new(0u64));

        let c1 = Arc::clone(&counter);
        let h1 = runtime::start_fiber(FiberAttr::default(), move || {
            for _ in 0..ITERATIONS {
                let mut guard = c1.lock();
                *guard += 1;
            }
        })
        .expect("start_fiber");

        let c2 = Arc::clone(&counter);
        let h2 = runtime::start_fiber(FiberAttr::default(), move || {
            for _ in 0..ITERATIONS {
                let mut guard = c2.lock();
                *guard += 1;
            }
        })
        .expect("start_fiber");

        h1.join();
        h2.join();
        *counter.lock()
    });

    assert_eq!(total, 2 * ITERATIONS);
}

struct Queue {
    items: VecDeque<u32>,
    producer_done: bool,
}

/// Scenario C: a producer fiber pushes 0..10,000 onto a `Mutex` + `Cond`
/// guarded queue; a consumer fiber pops them off. The consumer must see
/// exactly that run, in order.
#[test]
fn scenario_c_producer_consumer_preserves_order() {
    const COUNT: u32 = 10_000;

    let seen = run_on_runtime(small_group_config(), Topology::uniform(4), || {
        let queue = Arc::new(Mutex::new(Queue {
            items: VecDeque::new(),
            producer_done: false,
        }));
        let cond = Arc::new(Cond::new());

        let q1 = Arc::clone(&queue);
        let c1 = Arc::clone(&cond);
        let producer = runtime::start_fiber(FiberAttr::default(), move || {
            for i in 0..COUNT {
                {
                    let mut guard = q1.lock();
                    guard.items.push_back(i);
                }
                c1.notify_one();
            }
            {
                let mut guard = q1.lock();
                guard.producer_done = true;
            }
            c1.notify_one();
        })
        .expect("start_fiber");

        let q2 = Arc::clone(&queue);
        let c2 = Arc::clone(&cond);
        let consumer = runtime::start_fiber(FiberAttr::default(), move || -> Vec<u32> {
            let mut seen = Vec::with_capacity(COUNT as usize);
            loop {
                let mut guard = q2.lock();
                while guard.items.is_empty() && !guard.producer_done {
                    guard = c2.wait(guard);
                }
                match guard.items.pop_front() {
                    Some(v) => {
                        drop(guard);
                        seen.push(v);
                    }
                    None => return seen,
                }
            }
        })
        .expect("start_fiber");

        producer.join();
        consumer.join()
    });

    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(seen, expected);
}

/// Scenario D: a periodic timer firing every 100ms, ten times, each firing
/// within 20ms of its scheduled slot.
#[test]
fn scenario_d_periodic_timer_stays_on_schedule() {
    const FIRINGS: usize = 10;
    let interval = Duration::from_millis(100);
    let tolerance = Duration::from_millis(20);

    let (start, fired) = run_on_runtime(small_group_config(), Topology::uniform(4), move || {
        let fired = Arc::new(StdMutex::new(Vec::<Instant>::new()));
        let fired_cb = Arc::clone(&fired);
        let start = Instant::now();

        let id = timer::set_periodic_timer(start + interval, interval, move || {
            fired_cb.lock().unwrap().push(Instant::now());
        });

        loop {
            if fired.lock().unwrap().len() >= FIRINGS {
                break;
            }
            fiber::fiber_sleep_for(Duration::from_millis(5));
        }
        timer::stop_timer(id);

        let times = fired.lock().unwrap().clone();
        (start, times)
    });

    assert!(fired.len() >= FIRINGS);
    for (k, instant) in fired.iter().take(FIRINGS).enumerate() {
        let expected = start + interval * (k as u32 + 1);
        let diff = if *instant > expected { *instant - expected } else { expected - *instant };
        assert!(diff <= tolerance, "firing {k} off by {diff:?}");
    }
}

/// Scenario E: a latch of 100, counted down by 100 fibers each sleeping a
/// random 0-50ms first. A single waiter may only return once every one of
/// them has counted down.
#[test]
fn scenario_e_latch_waits_for_every_counter() {
    const FIBER_COUNT: usize = 100;

    let final_count = run_on_runtime(small_group_config(), Topology::uniform(4), || {
        let latch = Latch::new(FIBER_COUNT);
        let mut handles = Vec::with_capacity(FIBER_COUNT);

        for _ in 0..FIBER_COUNT {
            let latch = latch.clone();
            let handle = runtime::start_fiber(FiberAttr::default(), move || {
                let millis = rand::random::<u64>() % 50;
                fiber::fiber_sleep_for(Duration::from_millis(millis));
                latch.count_down();
            })
            .expect("start_fiber");
            handles.push(handle);
        }

        latch.wait();
        let count_after_wait = latch.count();
        for handle in handles {
            handle.join();
        }
        count_after_wait
    });

    assert_eq!(final_count, 0);
}

/// Scenario F: one fiber is joined from another while it waits out a timed
/// `Cond`. The wait must time out, the target fiber must keep running past
/// it, and only then does the join return.
#[test]
fn scenario_f_join_waits_past_a_timed_wait() {
    let timed_out = run_on_runtime(small_group_config(), Topology::uniform(4), || {
        let mutex = Arc::new(Mutex::new(()));
        let cond = Arc::new(Cond::new());
        let timed_out = Arc::new(AtomicBool::new(false));

        let m = Arc::clone(&mutex);
        let c = Arc::clone(&cond);
        let flag = Arc::clone(&timed_out);
        let target = runtime::start_fiber(FiberAttr::default(), move || {
            let guard = m.lock();
            let (_guard, result) = c.wait_timeout(guard, Duration::from_millis(50));
            flag.store(result.timed_out(), Ordering::SeqCst);
        })
        .expect("start_fiber");

        let joiner = runtime::start_fiber(FiberAttr::default(), move || {
            target.join();
        })
        .expect("start_fiber");
        joiner.join();

        timed_out.load(Ordering::SeqCst)
    });

    assert!(timed_out, "the target fiber's condvar wait should have timed out, not been woken");
}
