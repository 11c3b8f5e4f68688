//! # distfiber-core
//!
//! Core types for the distfiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching and the scheduling engine live in
//! `distfiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine
//! - `error` - Error types
//! - `kprint` - Kernel-style logging macros over the `log` facade
//! - `env` - Environment variable parsing for configuration

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use error::{FiberError, FiberResult, MemoryError, WorkerError};

/// Constants shared by the runtime and its configuration
pub mod constants {
    /// Default stack size for spawned fibers (256 KiB of reserved memory,
    /// committed lazily by the kernel)
    pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

    /// Stack size of the per-thread maintenance fiber
    pub const MAINTENANCE_STACK_SIZE: usize = 100 * 1024;

    /// Smallest stack a fiber may request
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Maximum fibers stolen from one peer per `load_balance` call
    pub const STEAL_QUOTA: usize = 16;

    /// Maximum schedulers (OS threads) per runtime
    pub const MAX_SCHEDULERS: usize = 64;

    /// No-scheduler sentinel for affinity/home fields
    pub const SCHEDULER_NONE: usize = usize::MAX;
}
