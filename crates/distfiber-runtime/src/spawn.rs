//! Spawning and joining fibers

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use distfiber_core::constants::MIN_STACK_SIZE;
use distfiber_core::error::{FiberError, FiberResult};
use distfiber_core::{kdebug, FiberId};

use crate::fiber::{Fiber, FiberKind, FiberRef};
use crate::manager::{fiber_entry, Manager};
use crate::scheduler::FiberScheduler;

type Packet<T> = Arc<Mutex<Option<thread::Result<T>>>>;

/// Fiber factory with per-fiber options
///
/// ```ignore
/// let handle = Builder::new()
///     .name("accept")
///     .stack_size(64 * 1024)
///     .affinity(1)
///     .spawn(|| 42)?;
/// assert_eq!(handle.join()?, 42);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    affinity: Option<usize>,
    pinned: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stack bytes; defaults to the runtime's configured size
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Start on scheduler `id` and return there after every wake-up
    pub fn affinity(mut self, id: usize) -> Self {
        self.affinity = Some(id);
        self
    }

    /// Never let the fiber leave its first scheduler: no stealing, and
    /// `migrate` is rejected
    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Spawn `f` as a new fiber of the calling thread's runtime
    pub fn spawn<F, T>(self, f: F) -> FiberResult<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let manager = Manager::current().ok_or(FiberError::NotInitialized)?;
        let registry = manager.registry();

        let target = self.affinity.unwrap_or(manager.id());
        let scheduler = registry.scheduler(target)?;
        let affinity = if self.pinned { Some(target) } else { self.affinity };

        let size = self
            .stack_size
            .unwrap_or(registry.config().stack_size)
            .max(MIN_STACK_SIZE);
        let stack = registry.stacks().acquire(size)?;

        let packet: Packet<T> = Arc::new(Mutex::new(None));
        let their_packet = Arc::clone(&packet);
        let entry = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            *their_packet.lock() = Some(result);
        });

        let fiber = Fiber::with_stack(
            registry.alloc_fiber_id(),
            FiberKind::User,
            self.name,
            stack,
            fiber_entry,
            Some(entry),
            affinity,
            self.pinned,
        );
        // Wake-ups before the first dispatch go to the spawn target
        fiber.set_home(target);
        kdebug!("spawn fiber {} on {}", fiber.id(), target);

        registry.fiber_started();
        scheduler.schedule(Arc::clone(&fiber));
        registry.wake_idle_peer(target);

        Ok(JoinHandle { fiber, packet })
    }
}

/// Spawn `f` with default options
pub fn spawn<F, T>(f: F) -> FiberResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

/// Owned permission to join a fiber
///
/// `join` consumes the handle, so a fiber can be joined at most once:
///
/// ```compile_fail
/// # fn demo(handle: distfiber_runtime::spawn::JoinHandle<()>) {
/// let _ = handle.join();
/// let _ = handle.join();
/// # }
/// ```
///
/// Dropping the handle detaches the fiber; it still runs to completion.
pub struct JoinHandle<T> {
    fiber: FiberRef,
    packet: Packet<T>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.fiber.name()
    }

    /// Has the fiber's closure returned?
    pub fn is_finished(&self) -> bool {
        self.fiber.is_done()
    }

    /// Wait for the fiber and take its result
    ///
    /// Inside a runtime the calling fiber parks until the target finishes.
    /// Other threads spin, yielding the OS thread.
    pub fn join(self) -> FiberResult<T> {
        loop {
            let Some(manager) = Manager::current() else {
                while !self.fiber.is_done() {
                    thread::yield_now();
                }
                break;
            };
            let mut finished = false;
            manager.park(|parker| {
                let mut slot = self.fiber.exit_slot();
                if slot.done {
                    finished = true;
                    return false;
                }
                slot.waiter = Some(parker);
                true
            });
            if finished {
                break;
            }
        }

        match self.packet.lock().take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(payload)) => Err(FiberError::Panicked(panic_message(&*payload))),
            None => Err(FiberError::Cancelled),
        }
    }

    /// Let the fiber run on without a handle
    pub fn detach(self) {}
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("fiber", &self.fiber.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
