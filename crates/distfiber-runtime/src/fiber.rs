//! Fiber control block
//!
//! A [`Fiber`] is shared through [`FiberRef`] by its join handle, the queue
//! node that carries it while runnable, the manager running it, and any
//! wait list it is parked on. Its queue node lives in the fiber while the
//! fiber is *not* queued and travels with the fiber reference while it is,
//! so a fiber can be linked into at most one queue at a time.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use distfiber_core::constants::SCHEDULER_NONE;
use distfiber_core::{FiberId, FiberState};

use crate::arch::{self, Context, EntryFn};
use crate::memory::Stack;
use crate::park::Parker;
use crate::queue::Node;

/// Shared fiber handle
pub type FiberRef = Arc<Fiber>;

/// Queue node type carrying fibers
pub type FiberNode = Node<FiberRef>;

/// Boxed entry closure
pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Role of a fiber in its runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberKind {
    /// A runtime thread's own OS-thread context
    Root,
    /// Per-thread idle loop
    Maintenance,
    /// Spawned by user code
    User,
}

/// Completion slot: set once when the entry closure returns (or the fiber
/// is dropped by shutdown), read by joiners
#[derive(Default)]
pub(crate) struct ExitSlot {
    pub done: bool,
    pub waiter: Option<Parker>,
}

pub struct Fiber {
    id: FiberId,
    kind: FiberKind,
    name: Option<String>,
    state: AtomicU8,
    /// Written only by `swap_context` on the thread switching away from
    /// this fiber
    context: UnsafeCell<Context>,
    stack: Mutex<Option<Stack>>,
    entry: Mutex<Option<Entry>>,
    node: AtomicPtr<FiberNode>,
    /// Scheduler that last dispatched this fiber
    home: AtomicUsize,
    /// Designated scheduler, `SCHEDULER_NONE` if unset
    affinity: usize,
    pinned: bool,
    /// Set by `migrate` until the target scheduler dispatches the fiber;
    /// peers leave it in place while set
    in_transit: AtomicBool,
    exit: Mutex<ExitSlot>,
}

// Safety: `context` is only touched by the thread that owns the fiber's
// execution at that moment; the state machine serializes ownership
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    fn alloc(
        id: FiberId,
        kind: FiberKind,
        name: Option<String>,
        stack: Option<Stack>,
        entry: Option<Entry>,
        affinity: usize,
        pinned: bool,
    ) -> FiberRef {
        Arc::new(Self {
            id,
            kind,
            name,
            state: AtomicU8::new(FiberState::Ready as u8),
            context: UnsafeCell::new(Context::default()),
            stack: Mutex::new(stack),
            entry: Mutex::new(entry),
            node: AtomicPtr::new(Box::into_raw(FiberNode::new())),
            home: AtomicUsize::new(affinity),
            affinity,
            pinned,
            in_transit: AtomicBool::new(false),
            exit: Mutex::new(ExitSlot::default()),
        })
    }

    /// Stackless fiber standing for the OS thread bound to `scheduler`.
    /// It starts RUNNING and is pinned to its thread.
    pub(crate) fn root(scheduler: usize) -> FiberRef {
        let fiber = Self::alloc(FiberId::ROOT, FiberKind::Root, None, None, None, scheduler, true);
        fiber.set_state(FiberState::Running);
        fiber
    }

    /// Fiber that starts executing `entry_fn(ptr to the fiber)` on `stack`
    /// when first switched to. `entry` is stored for `entry_fn` to take.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_stack(
        id: FiberId,
        kind: FiberKind,
        name: Option<String>,
        stack: Stack,
        entry_fn: EntryFn,
        entry: Option<Entry>,
        affinity: Option<usize>,
        pinned: bool,
    ) -> FiberRef {
        let top = stack.top();
        let fiber = Self::alloc(
            id,
            kind,
            name,
            Some(stack),
            entry,
            affinity.unwrap_or(SCHEDULER_NONE),
            pinned,
        );
        // Safety: the fiber is not visible to any scheduler yet and the
        // stack lives as long as the fiber
        unsafe {
            arch::init_context(fiber.context_ptr(), top, entry_fn, Arc::as_ptr(&fiber) as usize);
        }
        fiber
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> FiberKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Scheduler this fiber is bound to, if any
    #[inline]
    pub fn affinity(&self) -> Option<usize> {
        (self.affinity != SCHEDULER_NONE).then_some(self.affinity)
    }

    #[inline]
    pub fn home(&self) -> usize {
        self.home.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_home(&self, scheduler: usize) {
        self.home.store(scheduler, Ordering::Relaxed);
    }

    /// Only the scheduler holding the fiber may dispatch it
    #[inline]
    pub(crate) fn mark_in_transit(&self) {
        self.in_transit.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_in_transit(&self) {
        self.in_transit.store(false, Ordering::Relaxed);
    }

    /// Migrated and not yet dispatched by its target scheduler
    #[inline]
    pub fn is_in_transit(&self) -> bool {
        self.in_transit.load(Ordering::Acquire)
    }

    /// Where a woken fiber is re-scheduled: affinity, else last home
    #[inline]
    pub fn designated_scheduler(&self) -> usize {
        self.affinity().unwrap_or_else(|| self.home())
    }

    // State

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically move `from` -> `to`; false if the state was not `from`
    #[inline]
    pub(crate) fn cas_state(&self, from: FiberState, to: FiberState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    // Queue linkage

    /// Take the queue node out of the fiber; `None` if it is already queued
    pub(crate) fn detach_node(&self) -> Option<Box<FiberNode>> {
        let node = self.node.swap(ptr::null_mut(), Ordering::AcqRel);
        // Safety: non-null pointers stored here come from Box::into_raw
        (!node.is_null()).then(|| unsafe { Box::from_raw(node) })
    }

    /// Return the node after the fiber has been dequeued
    pub(crate) fn attach_node(&self, node: Box<FiberNode>) {
        let prev = self.node.swap(Box::into_raw(node), Ordering::AcqRel);
        debug_assert!(prev.is_null(), "fiber {} had two queue nodes", self.id);
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.node.load(Ordering::Acquire).is_null()
    }

    // Entry / stack

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().take()
    }

    pub(crate) fn take_stack(&self) -> Option<Stack> {
        self.stack.lock().take()
    }

    // Completion

    pub(crate) fn exit_slot(&self) -> parking_lot::MutexGuard<'_, ExitSlot> {
        self.exit.lock()
    }

    /// Mark finished and hand back the join waiter to wake
    pub(crate) fn complete(&self) -> Option<Parker> {
        let mut slot = self.exit.lock();
        slot.done = true;
        self.set_state(FiberState::Done);
        slot.waiter.take()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.exit.lock().done
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let node = *self.node.get_mut();
        if !node.is_null() {
            // Safety: owned node, see detach_node
            unsafe { drop(Box::from_raw(node)) };
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("home", &self.home())
            .field("pinned", &self.pinned)
            .field("in_transit", &self.is_in_transit())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn never_entered(_arg: usize) -> ! {
        std::process::abort()
    }

    fn user_fiber(id: u32, affinity: Option<usize>, pinned: bool) -> FiberRef {
        let stack = Stack::new(16 * 1024).unwrap();
        Fiber::with_stack(
            FiberId::new(id),
            FiberKind::User,
            Some(format!("f{}", id)),
            stack,
            never_entered,
            Some(Box::new(|| {})),
            affinity,
            pinned,
        )
    }

    #[test]
    fn test_new_fiber_is_ready_and_unqueued() {
        let f = user_fiber(7, None, false);
        assert_eq!(f.id(), FiberId::new(7));
        assert_eq!(f.state(), FiberState::Ready);
        assert!(!f.is_queued());
        assert_eq!(f.affinity(), None);
        assert_eq!(f.name(), Some("f7"));
    }

    #[test]
    fn test_node_detach_attach() {
        let f = user_fiber(1, None, false);
        let mut node = f.detach_node().unwrap();
        assert!(f.is_queued());
        assert!(f.detach_node().is_none());

        node.put(Arc::clone(&f));
        let carried = node.take().unwrap();
        assert!(Arc::ptr_eq(&carried, &f));
        f.attach_node(node);
        assert!(!f.is_queued());
    }

    #[test]
    fn test_state_cas() {
        let f = user_fiber(2, None, false);
        f.set_state(FiberState::SavingState);
        assert!(!f.cas_state(FiberState::Blocked, FiberState::Ready));
        assert!(f.cas_state(FiberState::SavingState, FiberState::Blocked));
        assert_eq!(f.state(), FiberState::Blocked);
    }

    #[test]
    fn test_designated_scheduler() {
        let f = user_fiber(3, None, false);
        f.set_home(2);
        assert_eq!(f.designated_scheduler(), 2);

        let g = user_fiber(4, Some(1), true);
        g.set_home(3);
        assert_eq!(g.designated_scheduler(), 1);
        assert!(g.is_pinned());
    }

    #[test]
    fn test_in_transit_flag() {
        let f = user_fiber(8, None, false);
        assert!(!f.is_in_transit());
        f.mark_in_transit();
        assert!(f.is_in_transit());
        assert!(!f.is_pinned());
        f.clear_in_transit();
        assert!(!f.is_in_transit());
    }

    #[test]
    fn test_root_fiber() {
        let root = Fiber::root(5);
        assert_eq!(root.kind(), FiberKind::Root);
        assert_eq!(root.state(), FiberState::Running);
        assert!(root.is_pinned());
        assert_eq!(root.affinity(), Some(5));
        assert!(root.take_stack().is_none());
    }

    #[test]
    fn test_complete_sets_done() {
        let f = user_fiber(6, None, false);
        assert!(!f.is_done());
        assert!(f.complete().is_none());
        assert!(f.is_done());
        assert_eq!(f.state(), FiberState::Done);
    }
}
