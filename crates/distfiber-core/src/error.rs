//! Error types for the fiber runtime
//!
//! Only resource exhaustion and API misuse surface as values. Queue
//! contention (EMPTY/RETRY, failed steals) is flow control and never reaches
//! this module; broken scheduling invariants abort the process instead.

use thiserror::Error;

/// Result type for runtime operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors returned by the public fiber API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError {
    /// Stack reservation for a new fiber failed
    #[error("stack allocation failed: {0}")]
    StackAllocation(#[from] MemoryError),

    /// The calling thread is not bound to a runtime
    #[error("runtime not initialized on this thread")]
    NotInitialized,

    /// The calling thread already hosts a runtime
    #[error("runtime already initialized on this thread")]
    AlreadyInitialized,

    /// Scheduler id outside the runtime's table
    #[error("scheduler {id} out of range (runtime has {count})")]
    InvalidScheduler { id: usize, count: usize },

    /// Pinned fibers never leave their home scheduler
    #[error("pinned fiber cannot migrate")]
    Pinned,

    /// The fiber's entry closure panicked
    #[error("fiber panicked: {0}")]
    Panicked(String),

    /// The runtime shut down before the fiber ran to completion
    #[error("fiber cancelled by runtime shutdown")]
    Cancelled,

    /// Rejected runtime configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Worker thread failure
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Stack memory errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// mmap failed
    #[error("memory allocation failed")]
    AllocationFailed,

    /// mprotect on the guard page failed
    #[error("memory protection change failed")]
    ProtectionFailed,

    /// Requested size overflows the address space
    #[error("requested stack size overflows")]
    Overflow,
}

/// Worker thread errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    #[error("failed to spawn worker thread")]
    SpawnFailed,

    /// Worker thread panicked
    #[error("worker thread panicked")]
    Panicked,
}
