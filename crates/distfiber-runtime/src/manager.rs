//! Per-thread manager and the context-switch protocol
//!
//! A [`Manager`] is bound to every runtime thread. It knows the thread's
//! scheduler, the fiber currently running on the thread, the thread's root
//! fiber and its lazily created maintenance fiber.
//!
//! # Switch protocol
//!
//! The outgoing fiber never finishes its own suspension. `switch_to` stores
//! it in `pending` together with a [`SwitchAction`], swaps contexts, and the
//! incoming side (back in `switch_to` after the swap, or at the top of a
//! fresh fiber's entry) completes the action:
//!
//! | action     | outgoing fiber                                     |
//! |------------|----------------------------------------------------|
//! | `Requeued` | SAVING -> READY, it is already in some queue       |
//! | `Blocked`  | SAVING -> BLOCKED, a parker for it exists          |
//! | `Idle`     | -> READY, root or maintenance, never queued        |
//! | `Exited`   | stack returned to the pool, reference dropped      |
//!
//! Only after the swap has written the outgoing context can another thread
//! dispatch that fiber, since schedulers skip SAVING fibers.
//!
//! # Migration
//!
//! Any suspension point may resume a fiber on a different OS thread. After
//! a swap the code re-resolves the manager through [`Manager::current`] and
//! never touches the `&self` it held before the swap. A fiber moved by
//! [`Manager::migrate`] is marked in transit, so idle peers do not steal it
//! back before its target scheduler has run it.

use std::cell::{Cell, OnceCell};
use std::hint;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use distfiber_core::error::{FiberError, FiberResult};
use distfiber_core::{kdebug, kprint, ktrace, FiberId, FiberState};

use crate::arch;
use crate::fiber::{Fiber, FiberKind, FiberRef};
use crate::memory::Stack;
use crate::park::Parker;
use crate::parking::ThreadParking;
use crate::registry::Registry;
use crate::scheduler::{DistScheduler, FiberScheduler};

thread_local! {
    static MANAGER: Cell<*const Manager> = const { Cell::new(ptr::null()) };
}

/// What the incoming side does with the outgoing fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchAction {
    Requeued,
    Blocked,
    Idle,
    Exited,
}

struct Pending {
    fiber: FiberRef,
    action: SwitchAction,
}

pub struct Manager {
    registry: Arc<Registry>,
    id: usize,
    /// Worker threads leave at shutdown; scheduler 0 belongs to the caller
    worker: bool,
    current: Cell<Option<FiberRef>>,
    root: FiberRef,
    maintenance: OnceCell<FiberRef>,
    pending: Cell<Option<Pending>>,
}

impl Manager {
    /// Bind the calling thread to scheduler `id` of `registry`. The
    /// thread's own context becomes the pinned root fiber.
    pub fn bind(registry: Arc<Registry>, id: usize, worker: bool) -> FiberResult<()> {
        if Self::current().is_some() {
            return Err(FiberError::AlreadyInitialized);
        }
        registry.scheduler(id)?;

        let root = Fiber::root(id);
        let manager = Box::new(Manager {
            registry,
            id,
            worker,
            current: Cell::new(Some(Arc::clone(&root))),
            root,
            maintenance: OnceCell::new(),
            pending: Cell::new(None),
        });
        MANAGER.with(|m| m.set(Box::into_raw(manager)));
        kprint::set_worker_id(id as u32);
        kdebug!("scheduler {} bound", id);
        Ok(())
    }

    /// Detach the calling thread from its runtime. Must run on the root
    /// fiber. Returns the registry the thread was bound to.
    pub fn unbind() -> Option<Arc<Registry>> {
        let raw = MANAGER.try_with(|m| m.replace(ptr::null())).ok()?;
        if raw.is_null() {
            return None;
        }
        // Safety: produced by Box::into_raw in bind, cleared above
        let manager = unsafe { Box::from_raw(raw as *mut Manager) };
        let on_root = manager
            .current
            .take()
            .map_or(false, |cur| Arc::ptr_eq(&cur, &manager.root));
        if !on_root {
            crate::violation!("scheduler {} unbound off its root fiber", manager.id);
        }
        kdebug!("scheduler {} unbound", manager.id);
        kprint::clear_worker_id();
        Some(Arc::clone(&manager.registry))
    }

    /// Manager of the calling thread
    ///
    /// The reference is only valid until the current fiber next suspends:
    /// the fiber may resume on another thread with another manager.
    #[inline(never)]
    pub(crate) fn current() -> Option<&'static Manager> {
        let raw = MANAGER.try_with(|m| m.get()).unwrap_or(ptr::null());
        // Safety: non-null only between bind and unbind on this thread
        unsafe { raw.as_ref() }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[inline]
    pub fn scheduler(&self) -> &DistScheduler {
        self.registry.scheduler_at(self.id)
    }

    /// Fiber running on this thread
    pub fn current_fiber(&self) -> FiberRef {
        let cur = self.current.take();
        let out = cur.clone();
        self.current.set(cur);
        match out {
            Some(fiber) => fiber,
            None => crate::violation!("scheduler {} has no current fiber", self.id),
        }
    }

    pub fn current_id(&self) -> FiberId {
        self.current_fiber().id()
    }

    // Suspension points

    /// Let another ready fiber run; returns at once if there is none
    pub fn yield_now(&self) {
        let sched = self.scheduler();
        let Some(next) = sched.next() else {
            return;
        };
        let cur = self.current_fiber();
        cur.set_state(FiberState::SavingState);
        sched.schedule(cur);
        self.switch_to(next, SwitchAction::Requeued);
    }

    /// Move the current fiber to scheduler `target`
    pub fn migrate(&self, target: usize) -> FiberResult<()> {
        let target_sched = self.registry.scheduler(target)?;
        let cur = self.current_fiber();
        if cur.is_pinned() {
            return Err(FiberError::Pinned);
        }
        if target == self.id {
            drop(cur);
            self.yield_now();
            return Ok(());
        }

        ktrace!("fiber {} migrating {} -> {}", cur.id(), self.id, target);
        let next = self.next_or_maintenance();
        cur.set_state(FiberState::SavingState);
        cur.set_home(target);
        cur.mark_in_transit();
        target_sched.schedule(cur);
        self.switch_to(next, SwitchAction::Requeued);
        Ok(())
    }

    /// See [`crate::park::park`]
    pub(crate) fn park<F>(&self, register: F)
    where
        F: FnOnce(Parker) -> bool,
    {
        let cur = self.current_fiber();
        cur.set_state(FiberState::SavingState);
        if !register(Parker::new(Arc::clone(&cur), &self.registry)) {
            cur.set_state(FiberState::Running);
            return;
        }
        drop(cur);
        let next = self.next_or_maintenance();
        self.switch_to(next, SwitchAction::Blocked);
    }

    /// Leave the finished current fiber for good
    fn exit_current(&self) -> ! {
        let next = self.next_or_maintenance();
        self.switch_to(next, SwitchAction::Exited);
        crate::violation!("finished fiber resumed")
    }

    // Switching

    fn next_or_maintenance(&self) -> FiberRef {
        match self.scheduler().next() {
            Some(next) => next,
            None => self.maintenance(),
        }
    }

    fn maintenance(&self) -> FiberRef {
        if let Some(fiber) = self.maintenance.get() {
            return Arc::clone(fiber);
        }
        let size = self.registry.config().maintenance_stack_size;
        let stack = match Stack::new(size) {
            Ok(stack) => stack,
            Err(e) => crate::violation!("scheduler {}: maintenance stack: {}", self.id, e),
        };
        let fiber = Fiber::with_stack(
            self.registry.alloc_fiber_id(),
            FiberKind::Maintenance,
            Some(format!("maintenance-{}", self.id)),
            stack,
            maintenance_entry,
            None,
            Some(self.id),
            true,
        );
        kdebug!("scheduler {} created maintenance fiber {}", self.id, fiber.id());
        let _ = self.maintenance.set(Arc::clone(&fiber));
        fiber
    }

    /// Make `next` current and swap to it. `self` is not used once the swap
    /// returns: the resumed fiber may be on another thread.
    fn switch_to(&self, next: FiberRef, action: SwitchAction) {
        let prev = match self.current.take() {
            Some(prev) => prev,
            None => crate::violation!("scheduler {} switching without a current fiber", self.id),
        };
        if Arc::ptr_eq(&prev, &next) {
            crate::violation!("fiber {} switched to itself", prev.id());
        }
        let from = prev.context_ptr();
        let to = next.context_ptr();

        next.set_state(FiberState::Running);
        next.set_home(self.id);
        self.current.set(Some(next));
        if self.pending.replace(Some(Pending { fiber: prev, action })).is_some() {
            crate::violation!("scheduler {} has an unfinished switch", self.id);
        }

        // Safety: `from` stays alive through `pending`, `to` through
        // `current`, and only this thread runs either fiber now
        unsafe { arch::swap_context(from, to) };

        Self::after_switch();
    }

    /// Complete the switch that just landed on this thread
    #[inline(never)]
    fn after_switch() {
        match Self::current() {
            Some(manager) => manager.finish_switch(),
            None => crate::violation!("fiber resumed on an unbound thread"),
        }
    }

    fn finish_switch(&self) {
        let Some(Pending { fiber, action }) = self.pending.take() else {
            return;
        };
        match action {
            SwitchAction::Requeued | SwitchAction::Idle => fiber.set_state(FiberState::Ready),
            SwitchAction::Blocked => {
                fiber.cas_state(FiberState::SavingState, FiberState::Blocked);
            }
            SwitchAction::Exited => {
                if let Some(stack) = fiber.take_stack() {
                    self.registry.stacks().release(stack);
                }
                ktrace!("fiber {} released", fiber.id());
            }
        }
    }

    // Idle loop

    /// Find a runnable fiber: local queue, then peers, then the poller
    fn find_work(&self) -> Option<FiberRef> {
        let sched = self.scheduler();
        if let Some(next) = sched.next() {
            return Some(next);
        }
        if sched.load_balance(self.registry.schedulers()) > 0 {
            if let Some(next) = sched.next() {
                return Some(next);
            }
        }
        if let Some(poller) = self.registry.poller() {
            if poller.poll(Some(Duration::ZERO)) > 0 {
                return sched.next();
            }
        }
        None
    }

    /// One maintenance cycle
    fn maintain(&self, idle_rounds: &mut u32) {
        let registry = &self.registry;
        if self.worker && registry.is_shutdown() && self.scheduler().is_empty() {
            let root = Arc::clone(&self.root);
            self.switch_to(root, SwitchAction::Idle);
            return;
        }

        if let Some(next) = self.find_work() {
            *idle_rounds = 0;
            self.switch_to(next, SwitchAction::Idle);
            return;
        }

        if *idle_rounds < registry.config().idle_spins {
            *idle_rounds += 1;
            hint::spin_loop();
            return;
        }
        *idle_rounds = 0;
        self.scheduler().parking().park(Some(registry.park_timeout()));
    }
}

/// Entry of every spawned fiber; `arg` points at its [`Fiber`]
pub(crate) extern "C" fn fiber_entry(arg: usize) -> ! {
    Manager::after_switch();
    {
        // Safety: the manager running this fiber holds a reference to it
        let fiber = unsafe { &*(arg as *const Fiber) };
        if let Some(entry) = fiber.take_entry() {
            entry();
        }
        ktrace!("fiber {} finished", fiber.id());
        // Off the live count before any joiner can observe completion
        if fiber.kind() == FiberKind::User {
            match Manager::current() {
                Some(manager) => manager.registry.fiber_finished(),
                None => crate::violation!("fiber finished on an unbound thread"),
            }
        }
        if let Some(waiter) = fiber.complete() {
            waiter.unpark();
        }
    }
    match Manager::current() {
        Some(manager) => manager.exit_current(),
        None => crate::violation!("fiber finished on an unbound thread"),
    }
}

extern "C" fn maintenance_entry(_arg: usize) -> ! {
    Manager::after_switch();
    let mut idle_rounds = 0u32;
    loop {
        match Manager::current() {
            Some(manager) => manager.maintain(&mut idle_rounds),
            None => crate::violation!("maintenance fiber on an unbound thread"),
        }
    }
}

/// Body of a worker thread's root fiber: hand the thread to the maintenance
/// fiber until shutdown drains the local queue
pub(crate) fn run_worker() {
    loop {
        let Some(manager) = Manager::current() else {
            return;
        };
        if manager.registry.is_shutdown() && manager.scheduler().is_empty() {
            return;
        }
        let maintenance = manager.maintenance();
        manager.switch_to(maintenance, SwitchAction::Idle);
    }
}
