//! Runtime configuration
//!
//! Library defaults with environment overrides, adjusted through builder
//! methods:
//!
//! ```rust,ignore
//! use distfiber_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .threads(4)
//!     .steal_quota(32);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use distfiber_core::constants::{
    DEFAULT_STACK_SIZE, MAINTENANCE_STACK_SIZE, MAX_SCHEDULERS, MIN_STACK_SIZE, STEAL_QUOTA,
};
use distfiber_core::env::{env_get, env_get_bool};
use distfiber_core::error::{FiberError, FiberResult};

use crate::park::ReadinessPoller;

/// Library defaults
pub mod defaults {
    pub const IDLE_SPINS: u32 = 64;
    pub const PARK_TIMEOUT_US: u64 = 1_000;
    pub const STACK_CACHE: usize = 64;
    pub const THREAD_NAME: &str = "distfiber-worker";
}

/// Runtime configuration with builder pattern
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Scheduler count, including the thread that creates the runtime
    pub threads: usize,
    /// Default stack size for spawned fibers
    pub stack_size: usize,
    /// Stack size of each thread's maintenance fiber
    pub maintenance_stack_size: usize,
    /// Maximum fibers taken from one peer per steal pass
    pub steal_quota: usize,
    /// Idle maintenance cycles before parking the thread
    pub idle_spins: u32,
    /// Upper bound on one idle park
    pub park_timeout: Duration,
    /// Pin worker threads to CPUs (Linux)
    pub pin_threads: bool,
    /// Released stacks kept for reuse
    pub stack_cache: usize,
    /// Worker thread name prefix
    pub thread_name: String,
    /// I/O readiness hook polled by idle schedulers
    pub poller: Option<Arc<dyn ReadinessPoller>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Library defaults without environment overrides
    pub fn new() -> Self {
        Self {
            threads: default_threads(),
            stack_size: DEFAULT_STACK_SIZE,
            maintenance_stack_size: MAINTENANCE_STACK_SIZE,
            steal_quota: STEAL_QUOTA,
            idle_spins: defaults::IDLE_SPINS,
            park_timeout: Duration::from_micros(defaults::PARK_TIMEOUT_US),
            pin_threads: false,
            stack_cache: defaults::STACK_CACHE,
            thread_name: defaults::THREAD_NAME.to_string(),
            poller: None,
        }
    }

    /// Library defaults with environment overrides
    ///
    /// - `DISTFIBER_THREADS` - scheduler count
    /// - `DISTFIBER_STACK_SIZE` - fiber stack bytes
    /// - `DISTFIBER_MAINT_STACK_SIZE` - maintenance stack bytes
    /// - `DISTFIBER_STEAL_QUOTA` - per-peer steal bound
    /// - `DISTFIBER_IDLE_SPINS` - idle cycles before parking
    /// - `DISTFIBER_PARK_TIMEOUT_US` - park timeout in microseconds
    /// - `DISTFIBER_PIN_THREADS` - pin workers to CPUs (0/1)
    /// - `DISTFIBER_STACK_CACHE` - cached stacks
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            threads: env_get("DISTFIBER_THREADS", base.threads),
            stack_size: env_get("DISTFIBER_STACK_SIZE", base.stack_size),
            maintenance_stack_size: env_get("DISTFIBER_MAINT_STACK_SIZE", base.maintenance_stack_size),
            steal_quota: env_get("DISTFIBER_STEAL_QUOTA", base.steal_quota),
            idle_spins: env_get("DISTFIBER_IDLE_SPINS", base.idle_spins),
            park_timeout: Duration::from_micros(env_get(
                "DISTFIBER_PARK_TIMEOUT_US",
                defaults::PARK_TIMEOUT_US,
            )),
            pin_threads: env_get_bool("DISTFIBER_PIN_THREADS", base.pin_threads),
            stack_cache: env_get("DISTFIBER_STACK_CACHE", base.stack_cache),
            ..base
        }
    }

    // Builder methods

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn maintenance_stack_size(mut self, size: usize) -> Self {
        self.maintenance_stack_size = size;
        self
    }

    pub fn steal_quota(mut self, n: usize) -> Self {
        self.steal_quota = n;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn pin_threads(mut self, enable: bool) -> Self {
        self.pin_threads = enable;
        self
    }

    pub fn stack_cache(mut self, n: usize) -> Self {
        self.stack_cache = n;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn poller(mut self, poller: Arc<dyn ReadinessPoller>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Reject configurations the runtime cannot start with
    pub fn validate(&self) -> FiberResult<()> {
        if self.threads == 0 {
            return Err(FiberError::InvalidConfig("threads must be > 0"));
        }
        if self.threads > MAX_SCHEDULERS {
            return Err(FiberError::InvalidConfig("threads must be <= 64"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberError::InvalidConfig("stack_size must be >= 16KB"));
        }
        if self.maintenance_stack_size < MIN_STACK_SIZE {
            return Err(FiberError::InvalidConfig("maintenance_stack_size must be >= 16KB"));
        }
        if self.steal_quota == 0 {
            return Err(FiberError::InvalidConfig("steal_quota must be > 0"));
        }
        Ok(())
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("threads", &self.threads)
            .field("stack_size", &self.stack_size)
            .field("maintenance_stack_size", &self.maintenance_stack_size)
            .field("steal_quota", &self.steal_quota)
            .field("idle_spins", &self.idle_spins)
            .field("park_timeout", &self.park_timeout)
            .field("pin_threads", &self.pin_threads)
            .field("stack_cache", &self.stack_cache)
            .field("thread_name", &self.thread_name)
            .field("poller", &self.poller.is_some())
            .finish()
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_SCHEDULERS)
}
