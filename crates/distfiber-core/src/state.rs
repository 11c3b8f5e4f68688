//! Fiber state machine
//!
//! ```text
//!            dispatch              yield / migrate          switch done
//!   READY ─────────────▶ RUNNING ───────────────▶ SAVING ────────────▶ READY
//!                          │  │     lock / join / park        │
//!                          │  └──────────────────────▶ SAVING ┴──────▶ BLOCKED
//!                          │                                               │
//!                          ▼ entry returned                          woken │
//!                         DONE                              READY ◀────────┘
//! ```
//!
//! `SavingState` is transient: the fiber is already visible in a queue (or a
//! wait list) but its register context has not been written yet. No scheduler
//! may dispatch a fiber in this state.

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable, waiting in a work queue (or parked root/maintenance context)
    Ready = 0,

    /// Currently executing on some OS thread
    Running = 1,

    /// Waiting on a mutex, a join, or an external wake-up
    Blocked = 2,

    /// Enqueued but its context is still being saved by the suspending thread
    SavingState = 3,

    /// Entry closure returned
    Done = 4,
}

impl FiberState {
    /// May a scheduler hand this fiber to `switch_to` right now?
    #[inline]
    pub const fn is_dispatchable(&self) -> bool {
        !matches!(self, FiberState::SavingState | FiberState::Running | FiberState::Done)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Blocked,
            3 => FiberState::SavingState,
            4 => FiberState::Done,
            // Only ever produced from our own `as u8` conversions
            _ => FiberState::Done,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Blocked => write!(f, "BLOCKED"),
            FiberState::SavingState => write!(f, "SAVING-STATE"),
            FiberState::Done => write!(f, "DONE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatchable() {
        assert!(FiberState::Ready.is_dispatchable());
        // A woken fiber may still read BLOCKED when it is popped
        assert!(FiberState::Blocked.is_dispatchable());
        assert!(!FiberState::SavingState.is_dispatchable());
        assert!(!FiberState::Running.is_dispatchable());
        assert!(!FiberState::Done.is_dispatchable());
    }

    #[test]
    fn test_u8_conversion() {
        for state in [
            FiberState::Ready,
            FiberState::Running,
            FiberState::Blocked,
            FiberState::SavingState,
            FiberState::Done,
        ] {
            assert_eq!(FiberState::from(u8::from(state)), state);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(FiberState::SavingState.to_string(), "SAVING-STATE");
        assert_eq!(FiberState::Blocked.to_string(), "BLOCKED");
    }
}
