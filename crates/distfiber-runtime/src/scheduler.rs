//! Per-thread distributed scheduler
//!
//! Every runtime thread owns one [`DistScheduler`]: a [`WorkQueue`] of
//! runnable fibers, a parking slot for its idle thread, and steal counters.
//! Any thread may push onto any scheduler's queue (spawn placement,
//! migration, wake-ups), and idle schedulers pull work from their peers
//! through the same non-blocking `try_pop` the owner uses.

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use distfiber_core::{kdebug, ktrace, FiberState};

use crate::fiber::{Fiber, FiberRef};
use crate::parking::{PlatformParking, ThreadParking};
use crate::queue::{Pop, WorkQueue};

/// Scheduling capability of one runtime thread
pub trait FiberScheduler: Send + Sync {
    /// Stable index of this scheduler in its runtime
    fn id(&self) -> usize;

    /// Make `fiber` runnable here. The fiber must not already be queued.
    fn schedule(&self, fiber: FiberRef);

    /// Next dispatchable fiber from the local queue
    fn next(&self) -> Option<FiberRef>;

    /// Move work from `peers` onto the local queue; returns fibers stolen
    fn load_balance(&self, peers: &[Self]) -> usize
    where
        Self: Sized;

    fn stats(&self) -> StealStats;
}

/// Scheduler counters (observability only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StealStats {
    /// Fibers moved from a peer onto this queue
    pub steals: u64,
    /// Steal attempts that came back empty, contended or pinned
    pub failed_steals: u64,
    /// Fibers found in SAVING-STATE and pushed back
    pub saving_requeues: u64,
    /// Fibers handed out by `next`
    pub dispatched: u64,
}

impl StealStats {
    pub fn merge(&mut self, other: &StealStats) {
        self.steals += other.steals;
        self.failed_steals += other.failed_steals;
        self.saving_requeues += other.saving_requeues;
        self.dispatched += other.dispatched;
    }
}

#[derive(Default)]
struct Counters {
    steals: AtomicU64,
    failed_steals: AtomicU64,
    saving_requeues: AtomicU64,
    dispatched: AtomicU64,
}

/// Work-stealing scheduler over a multi-producer queue
pub struct DistScheduler {
    id: usize,
    queue: WorkQueue<FiberRef>,
    parking: PlatformParking,
    steal_quota: usize,
    counters: Counters,
}

impl DistScheduler {
    pub fn new(id: usize, steal_quota: usize) -> Self {
        Self {
            id,
            queue: WorkQueue::new(),
            parking: PlatformParking::new(),
            steal_quota,
            counters: Counters::default(),
        }
    }

    /// Idle parking slot of this scheduler's thread
    #[inline]
    pub fn parking(&self) -> &PlatformParking {
        &self.parking
    }

    /// Approximate queued fibers
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop everything left in the queue, ignoring state. Used once all
    /// runtime threads have stopped.
    pub(crate) fn drain(&self) -> Vec<FiberRef> {
        let mut out = Vec::new();
        loop {
            match self.queue.try_pop() {
                Pop::Node(mut node) => {
                    if let Some(fiber) = node.take() {
                        fiber.attach_node(node);
                        out.push(fiber);
                    }
                }
                Pop::Retry => hint::spin_loop(),
                Pop::Empty => return out,
            }
        }
    }

    fn steal_from(&self, victim: &DistScheduler) -> usize {
        let mut taken = 0;
        while taken < self.steal_quota {
            match victim.queue.try_pop() {
                Pop::Node(node) => {
                    let stays = match node.get() {
                        Some(fiber) => fiber.is_pinned() || fiber.is_in_transit(),
                        None => crate::violation!("queue node of scheduler {} carries no fiber", victim.id),
                    };
                    if stays {
                        victim.queue.push(node);
                        self.counters.failed_steals.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    self.queue.push(node);
                    taken += 1;
                }
                Pop::Empty | Pop::Retry => {
                    self.counters.failed_steals.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
        taken
    }
}

impl FiberScheduler for DistScheduler {
    #[inline]
    fn id(&self) -> usize {
        self.id
    }

    fn schedule(&self, fiber: FiberRef) {
        let mut node = match fiber.detach_node() {
            Some(node) => node,
            None => crate::violation!(
                "fiber {} scheduled on {} while already queued",
                fiber.id(),
                self.id
            ),
        };
        ktrace!("schedule fiber {} on {}", fiber.id(), self.id);
        node.put(fiber);
        self.queue.push(node);
        self.parking.wake_one();
    }

    fn next(&self) -> Option<FiberRef> {
        let mut first_saving: Option<*const Fiber> = None;
        loop {
            let mut node = match self.queue.try_pop() {
                Pop::Node(node) => node,
                Pop::Empty => return None,
                Pop::Retry => {
                    hint::spin_loop();
                    continue;
                }
            };

            let (state, addr) = match node.get() {
                Some(fiber) => (fiber.state(), Arc::as_ptr(fiber)),
                None => crate::violation!("queue node of scheduler {} carries no fiber", self.id),
            };

            match state {
                FiberState::SavingState => {
                    self.counters.saving_requeues.fetch_add(1, Ordering::Relaxed);
                    self.queue.push(node);
                    // Seen twice: its switch may be waiting on this thread
                    if first_saving == Some(addr) {
                        return None;
                    }
                    first_saving.get_or_insert(addr);
                }
                state if state.is_dispatchable() => {
                    let fiber = node.take()?;
                    fiber.attach_node(node);
                    fiber.clear_in_transit();
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    return Some(fiber);
                }
                state => crate::violation!("fiber in state {} found in queue {}", state, self.id),
            }
        }
    }

    fn load_balance(&self, peers: &[Self]) -> usize {
        let n = peers.len();
        let mut stolen = 0;
        for k in 1..n {
            let victim = &peers[(self.id + k) % n];
            if victim.id == self.id {
                continue;
            }
            stolen += self.steal_from(victim);
        }
        if stolen > 0 {
            self.counters.steals.fetch_add(stolen as u64, Ordering::Relaxed);
            kdebug!("scheduler {} stole {} fibers", self.id, stolen);
        }
        stolen
    }

    fn stats(&self) -> StealStats {
        StealStats {
            steals: self.counters.steals.load(Ordering::Relaxed),
            failed_steals: self.counters.failed_steals.load(Ordering::Relaxed),
            saving_requeues: self.counters.saving_requeues.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DistScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistScheduler")
            .field("id", &self.id)
            .field("queued", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{Fiber, FiberKind};
    use crate::memory::Stack;
    use distfiber_core::FiberId;

    extern "C" fn never_entered(_arg: usize) -> ! {
        std::process::abort()
    }

    fn fiber(id: u32, pinned: bool) -> FiberRef {
        Fiber::with_stack(
            FiberId::new(id),
            FiberKind::User,
            None,
            Stack::new(16 * 1024).unwrap(),
            never_entered,
            None,
            pinned.then_some(0),
            pinned,
        )
    }

    fn schedulers(n: usize, quota: usize) -> Vec<DistScheduler> {
        (0..n).map(|id| DistScheduler::new(id, quota)).collect()
    }

    #[test]
    fn test_schedule_then_next_fifo() {
        let s = DistScheduler::new(0, 16);
        let fibers: Vec<_> = (1..=3).map(|i| fiber(i, false)).collect();
        for f in &fibers {
            s.schedule(Arc::clone(f));
            assert!(f.is_queued());
        }
        assert_eq!(s.len(), 3);

        for f in &fibers {
            let got = s.next().unwrap();
            assert!(Arc::ptr_eq(&got, f));
            assert!(!got.is_queued());
        }
        assert!(s.next().is_none());
        assert_eq!(s.stats().dispatched, 3);
    }

    #[test]
    fn test_saving_fiber_is_never_returned() {
        let s = DistScheduler::new(0, 16);
        let saving = fiber(1, false);
        let ready = fiber(2, false);
        saving.set_state(FiberState::SavingState);
        s.schedule(Arc::clone(&saving));
        s.schedule(Arc::clone(&ready));

        let got = s.next().unwrap();
        assert!(Arc::ptr_eq(&got, &ready));

        // Only the saving fiber left: reported as no work, still queued
        assert!(s.next().is_none());
        assert!(saving.is_queued());
        assert!(s.stats().saving_requeues >= 2);

        saving.set_state(FiberState::Ready);
        let got = s.next().unwrap();
        assert!(Arc::ptr_eq(&got, &saving));
    }

    #[test]
    fn test_blocked_then_woken_fiber_is_dispatchable() {
        let s = DistScheduler::new(0, 16);
        let f = fiber(1, false);
        f.set_state(FiberState::Blocked);
        s.schedule(Arc::clone(&f));
        assert!(s.next().is_some());
    }

    #[test]
    fn test_steal_respects_quota() {
        let peers = schedulers(2, 4);
        for i in 0..10 {
            peers[1].schedule(fiber(i, false));
        }

        assert_eq!(peers[0].load_balance(&peers), 4);
        assert_eq!(peers[0].len(), 4);
        assert_eq!(peers[1].len(), 6);
        let stats = peers[0].stats();
        assert_eq!(stats.steals, 4);
        assert_eq!(stats.failed_steals, 0);

        // Next pass takes the next batch
        assert_eq!(peers[0].load_balance(&peers), 4);
        assert_eq!(peers[0].load_balance(&peers), 2);
        assert_eq!(peers[1].len(), 0);
        // The last pass ran dry after two
        assert_eq!(peers[0].stats().failed_steals, 1);
    }

    #[test]
    fn test_steal_round_robin_from_next_peer() {
        let peers = schedulers(3, 1);
        peers[0].schedule(fiber(10, false));
        peers[2].schedule(fiber(20, false));

        // Scheduler 1 visits 2 first, then 0
        assert_eq!(peers[1].load_balance(&peers), 2);
        assert_eq!(peers[1].next().unwrap().id(), FiberId::new(20));
        assert_eq!(peers[1].next().unwrap().id(), FiberId::new(10));
    }

    #[test]
    fn test_pinned_fiber_is_not_stolen() {
        let peers = schedulers(2, 16);
        let pinned = fiber(1, true);
        peers[0].schedule(Arc::clone(&pinned));
        peers[0].schedule(fiber(2, false));

        assert_eq!(peers[1].load_balance(&peers), 0);
        assert_eq!(peers[1].stats().failed_steals, 1);
        assert_eq!(peers[0].len(), 2);

        // Pinned one went to the back; the free one is stealable now
        assert_eq!(peers[1].load_balance(&peers), 1);
        assert_eq!(peers[1].next().unwrap().id(), FiberId::new(2));
        assert!(Arc::ptr_eq(&peers[0].next().unwrap(), &pinned));
    }

    #[test]
    fn test_migrated_fiber_stays_until_dispatched() {
        let peers = schedulers(2, 16);
        let moved = fiber(1, false);
        moved.mark_in_transit();
        peers[0].schedule(Arc::clone(&moved));

        // Idle peer leaves it where migrate put it
        assert_eq!(peers[1].load_balance(&peers), 0);
        assert_eq!(peers[1].stats().failed_steals, 1);
        assert!(moved.is_queued());

        let got = peers[0].next().unwrap();
        assert!(Arc::ptr_eq(&got, &moved));
        assert!(!got.is_in_transit());

        // Stealable again once it has landed
        peers[0].schedule(got);
        assert_eq!(peers[1].load_balance(&peers), 1);
        assert!(Arc::ptr_eq(&peers[1].next().unwrap(), &moved));
    }

    #[test]
    fn test_single_scheduler_has_no_peers() {
        let peers = schedulers(1, 16);
        assert_eq!(peers[0].load_balance(&peers), 0);
        assert_eq!(peers[0].stats(), StealStats::default());
    }

    #[test]
    fn test_drain_returns_all() {
        let s = DistScheduler::new(0, 16);
        let f = fiber(1, false);
        f.set_state(FiberState::SavingState);
        s.schedule(Arc::clone(&f));
        s.schedule(fiber(2, false));

        let drained = s.drain();
        assert_eq!(drained.len(), 2);
        assert!(!f.is_queued());
        assert!(s.is_empty());
    }

    #[test]
    fn test_stats_merge() {
        let mut total = StealStats::default();
        total.merge(&StealStats { steals: 1, failed_steals: 2, saving_requeues: 3, dispatched: 4 });
        total.merge(&StealStats { steals: 1, failed_steals: 0, saving_requeues: 0, dispatched: 1 });
        assert_eq!(total, StealStats { steals: 2, failed_steals: 2, saving_requeues: 3, dispatched: 5 });
    }
}
