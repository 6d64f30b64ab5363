//! An M:N user-space fiber runtime: stackful coroutines cooperatively
//! scheduled over a fixed pool of OS worker threads, organized into
//! NUMA-aware scheduling groups.
//!
//! - [Runtime bootstrap](runtime): `start_runtime`/`terminate_runtime`,
//!   scheduling group introspection.
//! - [Fibers](fiber): `FiberAttr`, `JoinHandle`, `fiber_yield`,
//!   `fiber_sleep_for`/`fiber_sleep_until`.
//! - [Timers](timer): `set_timer`, `set_periodic_timer`, `stop_timer`.
//! - [Synchronization](sync): `Mutex`, `Cond`, `Latch`, `CountingSemaphore`,
//!   `Event`.
//! - [Fiber-local storage](fls): `FiberLocal<T>`.
//! - [Execution context propagation](execution_context): `ExecutionContext`.
//! - [Configuration](config): `RuntimeConfig`, `Profile`, `CpuSet`.
//! - [Topology](topology): `Topology`, `NumaNode`.
//! - [Error handling](error): `Error`, `Result`, `WaitTimeoutResult`.
//!
//! A program using this crate calls [`runtime::start_runtime`] once at
//! startup, spawns work onto it with [`runtime::start_fiber`], and calls
//! [`runtime::terminate_runtime`] to shut every worker and timer thread
//! down before exiting.

mod clock;
pub mod config;
mod context;
pub mod error;
pub mod execution_context;
pub mod fiber;
pub mod fls;
mod future;
mod group;
pub mod log;
mod run_queue;
pub mod runtime;
mod spinlock;
mod stack;
pub mod sync;
pub mod timer;
pub mod topology;
mod waitable;
mod worker;

pub use error::{Error, Result};
