//! Worker thread management
//!
//! Scheduler 0 belongs to the thread that creates the runtime; every other
//! scheduler gets a dedicated worker thread that binds its manager, runs the
//! maintenance loop until shutdown and unbinds again.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use distfiber_core::error::{FiberResult, WorkerError};
use distfiber_core::{kdebug, kerror, kwarn};

use crate::manager::{self, Manager};
use crate::registry::Registry;

/// Worker threads of one runtime
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start one worker for each scheduler `1..threads`
    pub fn start(registry: &Arc<Registry>) -> FiberResult<Self> {
        let config = registry.config();
        let mut pool = Self {
            handles: Vec::with_capacity(config.threads.saturating_sub(1)),
        };

        for id in 1..config.threads {
            let worker_registry = Arc::clone(registry);
            let pin = config.pin_threads;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, id))
                .spawn(move || worker_main(worker_registry, id, pin));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    kerror!("failed to spawn worker {}: {}", id, e);
                    // Let the ones already running wind down
                    registry.begin_shutdown();
                    pool.join();
                    return Err(WorkerError::SpawnFailed.into());
                }
            }
        }
        Ok(pool)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to leave. Returns the number that panicked.
    pub fn join(&mut self) -> usize {
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            kwarn!("{} worker threads panicked", panicked);
        }
        panicked
    }
}

fn worker_main(registry: Arc<Registry>, id: usize, pin: bool) {
    if pin {
        pin_to_cpu(id);
    }
    if let Err(e) = Manager::bind(registry, id, true) {
        kerror!("worker {} failed to bind: {}", id, e);
        return;
    }
    kdebug!("worker {} started", id);
    manager::run_worker();
    Manager::unbind();
    kdebug!("worker {} stopped", id);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn pin_to_cpu(id: usize) {
            use nix::sched::{sched_setaffinity, CpuSet};
            use nix::unistd::Pid;

            let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            let mut set = CpuSet::new();
            if let Err(e) = set.set(id % cpus) {
                kwarn!("worker {}: cpu set: {}", id, e);
                return;
            }
            if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
                kwarn!("worker {}: sched_setaffinity: {}", id, e);
            }
        }
    } else {
        fn pin_to_cpu(id: usize) {
            kdebug!("worker {}: CPU pinning unsupported on this platform", id);
        }
    }
}
