//! Condvar parking for platforms without futex

use super::ThreadParking;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub struct FallbackParking {
    /// Wake token
    pending: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn signal(&self, all: bool) {
        *self.pending.lock() = true;
        if all {
            self.condvar.notify_all();
        } else {
            self.condvar.notify_one();
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.parked.fetch_add(1, Ordering::SeqCst);
            match timeout {
                Some(t) => {
                    self.condvar.wait_for(&mut pending, t);
                }
                None => self.condvar.wait(&mut pending),
            }
            self.parked.fetch_sub(1, Ordering::SeqCst);
        }
        std::mem::replace(&mut *pending, false)
    }

    fn wake_one(&self) {
        self.signal(false);
    }

    fn wake_all(&self) {
        self.signal(true);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
