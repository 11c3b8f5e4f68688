//! Linux futex parking
//!
//! Futex word: 0 = no token, 1 = wake pending. `park` consumes a pending
//! token without sleeping; otherwise it waits while the word is 0.

use super::ThreadParking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParking {
    futex: AtomicU32,
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn wake(&self, count: i32) {
        self.futex.store(1, Ordering::Release);
        if self.parked.load(Ordering::SeqCst) > 0 {
            futex(&self.futex, libc::FUTEX_WAKE, count as u32, None);
        }
    }
}

fn futex(word: &AtomicU32, op: libc::c_int, val: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
    // Safety: `word` outlives the call; the kernel only reads `ts`
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op | libc::FUTEX_PRIVATE_FLAG,
            val,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadParking for FutexParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.futex.swap(0, Ordering::AcqRel) != 0 {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        // Sleeps only while the word is still 0; a racing wake makes the
        // kernel return EAGAIN and the token is consumed below
        futex(&self.futex, libc::FUTEX_WAIT, 0, timeout);
        self.parked.fetch_sub(1, Ordering::SeqCst);
        self.futex.swap(0, Ordering::AcqRel) != 0
    }

    fn wake_one(&self) {
        self.wake(1);
    }

    fn wake_all(&self) {
        self.wake(i32::MAX);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
