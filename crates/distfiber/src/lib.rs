//! # distfiber - cooperative fibers on a work-stealing thread pool
//!
//! Many lightweight stackful fibers share a small pool of OS threads. Each
//! thread runs one scheduler with its own multi-producer queue; idle
//! schedulers steal from their peers. Fibers switch only at explicit
//! suspension points: [`yield_now`], [`migrate`], a contended
//! [`FiberMutex`], [`JoinHandle::join`] and [`park`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use distfiber::{spawn, FiberMutex};
//! use std::sync::Arc;
//!
//! fn main() -> distfiber::FiberResult<()> {
//!     let _rt = distfiber::init(4)?;
//!
//!     let counter = Arc::new(FiberMutex::new(0));
//!     let handles: Vec<_> = (0..8)
//!         .map(|_| {
//!             let counter = Arc::clone(&counter);
//!             spawn(move || *counter.lock() += 1)
//!         })
//!         .collect::<Result<_, _>>()?;
//!     for h in handles {
//!         h.join()?;
//!     }
//!     assert_eq!(*counter.lock(), 8);
//!     Ok(())
//! }
//! ```
//!
//! ## Threads
//!
//! ```text
//!   creating thread          worker 1              worker N-1
//!  ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//!  │ root fiber   │      │ root fiber   │      │ root fiber   │
//!  │ scheduler 0  │◄────►│ scheduler 1  │◄────►│ scheduler N-1│
//!  │ maintenance  │steal │ maintenance  │steal │ maintenance  │
//!  └──────────────┘      └──────────────┘      └──────────────┘
//! ```
//!
//! The thread that creates the [`Runtime`] becomes scheduler 0: its own
//! context is the root fiber, and queued fibers run on it whenever the root
//! yields, joins or locks. The other schedulers get dedicated workers.
//!
//! Any suspension point may resume a fiber on another OS thread. Fibers
//! that hold thread-affine data must be spawned pinned.

use std::marker::PhantomData;
use std::sync::Arc;

pub use distfiber_core::{FiberError, FiberId, FiberResult, FiberState, MemoryError, WorkerError};

// Logging
pub use distfiber_core::{kdebug, kerror, kinfo, ktrace, kwarn};
pub use distfiber_core::kprint::{init as init_logging, set_log_level, LogLevel};

pub use distfiber_runtime::{
    current_id, current_scheduler, in_fiber, migrate, num_schedulers, park, spawn, yield_now,
    Builder, FiberMutex, FiberMutexGuard, JoinHandle, Parker, RawFiberMutex, ReadinessPoller,
    RuntimeConfig, StealStats,
};

use distfiber_runtime::{Manager, Registry, WorkerPool};

/// Snapshot of runtime counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Counters per scheduler, indexed by scheduler id
    pub schedulers: Vec<StealStats>,
    /// Sum over all schedulers
    pub total: StealStats,
    /// Spawned fibers that have not finished
    pub live_fibers: usize,
}

/// A running fiber runtime
///
/// Owns the worker threads and binds the creating thread as scheduler 0.
/// Not `Send`: it must be shut down on the thread that created it.
pub struct Runtime {
    registry: Arc<Registry>,
    workers: WorkerPool,
    running: bool,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Start a runtime on the calling thread
    pub fn new(config: RuntimeConfig) -> FiberResult<Self> {
        let registry = Arc::new(Registry::new(config)?);
        Manager::bind(Arc::clone(&registry), 0, false)?;

        let workers = match WorkerPool::start(&registry) {
            Ok(workers) => workers,
            Err(e) => {
                Manager::unbind();
                return Err(e);
            }
        };
        kinfo!(
            "runtime started: {} schedulers, {} workers",
            registry.num_schedulers(),
            workers.len()
        );

        Ok(Self {
            registry,
            workers,
            running: true,
            _not_send: PhantomData,
        })
    }

    #[inline]
    pub fn num_schedulers(&self) -> usize {
        self.registry.num_schedulers()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.registry.config()
    }

    /// Current scheduler counters and live fiber count
    pub fn stats(&self) -> RuntimeStats {
        let schedulers = self.registry.stats();
        let mut total = StealStats::default();
        for s in &schedulers {
            total.merge(s);
        }
        RuntimeStats {
            schedulers,
            total,
            live_fibers: self.registry.live_fibers(),
        }
    }

    /// Run `f` on the root fiber, then shut down
    pub fn block_on<F, T>(mut self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let result = f();
        self.shutdown();
        result
    }

    /// Stop the runtime
    ///
    /// Runs what is left on scheduler 0, tells the workers to leave once
    /// their queues are empty and waits for them. Fibers still queued after
    /// that are dropped; joining them reports [`FiberError::Cancelled`].
    /// Blocked fibers that nobody wakes are leaked with their stacks; if
    /// they are woken before the runtime is dropped, the drop cancels them.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        // The root fiber of scheduler 0 is the calling thread
        if let Some(local) = self.registry.schedulers().first() {
            while !local.is_empty() {
                yield_now();
            }
        }

        self.registry.begin_shutdown();
        let panicked = self.workers.join();
        if panicked > 0 {
            kwarn!("{} workers panicked before shutdown", panicked);
        }
        Manager::unbind();

        let dropped = self.registry.drain();
        kinfo!(
            "runtime stopped: {} fibers dropped, {} still live",
            dropped,
            self.registry.live_fibers()
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        // Fibers woken after shutdown
        self.registry.drain();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("workers", &self.workers.len())
            .field("running", &self.running)
            .finish()
    }
}

/// Start a runtime with `threads` schedulers and otherwise default
/// (environment-aware) settings
pub fn init(threads: usize) -> FiberResult<Runtime> {
    Runtime::new(RuntimeConfig::from_env().threads(threads))
}
