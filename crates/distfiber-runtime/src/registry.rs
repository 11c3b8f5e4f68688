//! Shared runtime state
//!
//! One [`Registry`] per runtime, shared by `Arc` with every manager: the
//! scheduler table, configuration, shutdown flag, fiber id allocator,
//! live-fiber gauge and the stack cache.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use distfiber_core::error::{FiberError, FiberResult};
use distfiber_core::{kdebug, FiberId};

use crate::config::RuntimeConfig;
use crate::memory::StackPool;
use crate::park::ReadinessPoller;
use crate::parking::ThreadParking;
use crate::scheduler::{DistScheduler, FiberScheduler, StealStats};

pub struct Registry {
    schedulers: Box<[DistScheduler]>,
    config: RuntimeConfig,
    shutdown: AtomicBool,
    next_fiber_id: AtomicU32,
    live_fibers: AtomicUsize,
    stacks: StackPool,
}

impl Registry {
    /// Build the scheduler table for a validated configuration
    pub fn new(config: RuntimeConfig) -> FiberResult<Self> {
        config.validate()?;
        let schedulers = (0..config.threads)
            .map(|id| DistScheduler::new(id, config.steal_quota))
            .collect();
        let stacks = StackPool::new(config.stack_size, config.stack_cache)?;
        Ok(Self {
            schedulers,
            config,
            shutdown: AtomicBool::new(false),
            // 0 is the root fiber id
            next_fiber_id: AtomicU32::new(1),
            live_fibers: AtomicUsize::new(0),
            stacks,
        })
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn schedulers(&self) -> &[DistScheduler] {
        &self.schedulers
    }

    #[inline]
    pub fn num_schedulers(&self) -> usize {
        self.schedulers.len()
    }

    /// Scheduler by id, range checked
    pub fn scheduler(&self, id: usize) -> FiberResult<&DistScheduler> {
        self.schedulers.get(id).ok_or(FiberError::InvalidScheduler {
            id,
            count: self.schedulers.len(),
        })
    }

    /// Scheduler by id for ids the runtime produced itself
    pub(crate) fn scheduler_at(&self, id: usize) -> &DistScheduler {
        match self.schedulers.get(id) {
            Some(s) => s,
            None => crate::violation!("scheduler id {} out of range", id),
        }
    }

    #[inline]
    pub(crate) fn stacks(&self) -> &StackPool {
        &self.stacks
    }

    #[inline]
    pub fn poller(&self) -> Option<&dyn ReadinessPoller> {
        self.config.poller.as_deref()
    }

    pub(crate) fn alloc_fiber_id(&self) -> FiberId {
        let mut id = self.next_fiber_id.fetch_add(1, Ordering::Relaxed);
        // Wrapped past the sentinel
        while id == FiberId::NONE.as_u32() || id == FiberId::ROOT.as_u32() {
            id = self.next_fiber_id.fetch_add(1, Ordering::Relaxed);
        }
        FiberId::new(id)
    }

    pub(crate) fn fiber_started(&self) {
        self.live_fibers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fiber_finished(&self) {
        self.live_fibers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Spawned fibers that have not finished
    #[inline]
    pub fn live_fibers(&self) -> usize {
        self.live_fibers.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Raise the shutdown flag and wake every idle thread
    pub fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            kdebug!("shutdown requested, {} fibers live", self.live_fibers());
        }
        for s in self.schedulers.iter() {
            s.parking().wake_all();
        }
    }

    /// Wake one parked scheduler other than `except`, so it can steal
    pub(crate) fn wake_idle_peer(&self, except: usize) {
        if let Some(s) = self
            .schedulers
            .iter()
            .find(|s| s.id() != except && s.parking().parked_count() > 0)
        {
            s.parking().wake_one();
        }
    }

    /// Idle park timeout from the configuration
    #[inline]
    pub(crate) fn park_timeout(&self) -> Duration {
        self.config.park_timeout
    }

    /// Drop every fiber still queued. Joiners of those fibers observe
    /// `FiberError::Cancelled`. Only valid once no runtime thread runs.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        for s in self.schedulers.iter() {
            for fiber in s.drain() {
                if fiber.kind() == crate::fiber::FiberKind::User {
                    self.fiber_finished();
                }
                drop(fiber.complete());
                dropped += 1;
            }
        }
        if dropped > 0 {
            kdebug!("shutdown dropped {} queued fibers", dropped);
        }
        dropped
    }

    /// Per-scheduler counters
    pub fn stats(&self) -> Vec<StealStats> {
        self.schedulers.iter().map(|s| s.stats()).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("schedulers", &self.schedulers.len())
            .field("shutdown", &self.is_shutdown())
            .field("live_fibers", &self.live_fibers())
            .finish()
    }
}
