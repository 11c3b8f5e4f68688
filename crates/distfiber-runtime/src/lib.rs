//! # distfiber-runtime
//!
//! Platform-specific half of the distfiber runtime.
//!
//! This crate provides:
//! - Guard-paged fiber stacks (mmap) and a stack cache
//! - Context switching (architecture-specific assembly)
//! - The multi-producer work queue and the work-stealing scheduler
//! - The per-thread manager driving the switch protocol
//! - Fiber mutex, join handles and the park/unpark seam
//! - Worker thread management and idle parking (futex on Linux)

pub mod arch;
pub mod memory;
pub mod parking;
pub mod queue;
pub mod fiber;
pub mod scheduler;
pub mod registry;
pub mod manager;
pub mod park;
pub mod mutex;
pub mod spawn;
pub mod config;
pub mod worker;

pub use config::RuntimeConfig;
pub use fiber::{Fiber, FiberKind, FiberRef};
pub use manager::Manager;
pub use mutex::{FiberMutex, FiberMutexGuard, RawFiberMutex};
pub use park::{park, Parker, ReadinessPoller};
pub use registry::Registry;
pub use scheduler::{DistScheduler, FiberScheduler, StealStats};
pub use spawn::{spawn, Builder, JoinHandle};
pub use worker::WorkerPool;

use distfiber_core::error::{FiberError, FiberResult};
use distfiber_core::FiberId;

/// Log at error level and abort: a scheduling invariant is broken and no
/// fiber state can be trusted
#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn abort_on_violation(args: std::fmt::Arguments<'_>) -> ! {
    distfiber_core::kerror!("contract violation: {}", args);
    // Also reaches stderr when no logger is installed
    eprintln!("distfiber: contract violation: {}", args);
    std::process::abort()
}

#[doc(hidden)]
#[macro_export]
macro_rules! violation {
    ($($arg:tt)*) => {
        $crate::abort_on_violation(format_args!($($arg)*))
    };
}

/// Let other ready fibers of this thread run. No-op outside a runtime.
pub fn yield_now() {
    if let Some(manager) = Manager::current() {
        manager.yield_now();
    }
}

/// Continue the current fiber on scheduler `target`
///
/// On return the fiber may be running on a different OS thread.
pub fn migrate(target: usize) -> FiberResult<()> {
    Manager::current()
        .ok_or(FiberError::NotInitialized)?
        .migrate(target)
}

/// Id of the running fiber (`FiberId::ROOT` on a runtime thread's own
/// context, `FiberId::NONE` outside a runtime)
pub fn current_id() -> FiberId {
    Manager::current().map_or(FiberId::NONE, |m| m.current_id())
}

/// Scheduler of the calling thread
pub fn current_scheduler() -> Option<usize> {
    Manager::current().map(|m| m.id())
}

/// Is the calling thread bound to a runtime?
pub fn in_fiber() -> bool {
    Manager::current().is_some()
}

/// Scheduler count of the calling thread's runtime
pub fn num_schedulers() -> Option<usize> {
    Manager::current().map(|m| m.registry().num_schedulers())
}
