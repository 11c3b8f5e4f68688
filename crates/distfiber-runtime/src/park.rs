//! Suspension seam
//!
//! [`park`] suspends the current fiber until someone calls
//! [`Parker::unpark`]. It is the single primitive behind mutex waits and
//! joins, and the contract an I/O layer builds on: register the parker with
//! a readiness source, let the runtime run other fibers, and unpark from a
//! [`ReadinessPoller`] when the source fires.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use distfiber_core::error::{FiberError, FiberResult};
use distfiber_core::{ktrace, FiberId, FiberState};

use crate::fiber::FiberRef;
use crate::manager::Manager;
use crate::registry::Registry;
use crate::scheduler::FiberScheduler;

/// Wake-up token for one parked fiber
///
/// Consumed by [`unpark`](Parker::unpark), so a fiber is woken at most once
/// per park.
pub struct Parker {
    fiber: FiberRef,
    registry: Weak<Registry>,
}

impl Parker {
    pub(crate) fn new(fiber: FiberRef, registry: &Arc<Registry>) -> Self {
        Self {
            fiber,
            registry: Arc::downgrade(registry),
        }
    }

    /// Id of the parked fiber
    pub fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Re-schedule the fiber on its designated scheduler. Safe to call from
    /// any thread, including threads outside the runtime. A no-op once the
    /// runtime is gone.
    pub fn unpark(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // Still SAVING is fine: schedulers skip it until the parking
        // thread finishes its switch
        let _ = self.fiber.cas_state(FiberState::Blocked, FiberState::Ready);
        let target = self.fiber.designated_scheduler();
        ktrace!("unpark fiber {} onto {}", self.fiber.id(), target);
        registry.scheduler_at(target).schedule(self.fiber);
    }
}

impl fmt::Debug for Parker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parker").field("fiber", &self.fiber.id()).finish()
    }
}

/// Readiness source polled by idle schedulers
///
/// `poll` should call [`Parker::unpark`] for every parked fiber whose event
/// fired and return how many it woke. Idle schedulers call it with a zero
/// timeout on every maintenance cycle.
pub trait ReadinessPoller: Send + Sync {
    fn poll(&self, timeout: Option<Duration>) -> usize;
}

/// Suspend the current fiber
///
/// The fiber is marked SAVING and `register` receives its [`Parker`].
/// Returning `false` declines the park: the fiber keeps running and the
/// parker must have been dropped. Returning `true` switches away; the fiber
/// resumes after `unpark`, possibly on another thread.
///
/// Fails with `NotInitialized` on a thread that is not part of a runtime.
pub fn park<F>(register: F) -> FiberResult<()>
where
    F: FnOnce(Parker) -> bool,
{
    let manager = Manager::current().ok_or(FiberError::NotInitialized)?;
    manager.park(register);
    Ok(())
}
