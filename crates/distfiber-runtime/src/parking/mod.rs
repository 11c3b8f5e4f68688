//! Scheduler thread parking
//!
//! Each scheduler owns one parking slot. Its maintenance fiber parks the
//! thread when no work is reachable; `schedule` onto that scheduler (and
//! shutdown) wakes it. A wake issued while nobody is parked is remembered
//! as a pending token, so the next `park` returns immediately.

use std::time::Duration;

/// Sleep/wake primitive for an idle scheduler thread
pub trait ThreadParking: Send + Sync {
    /// Park the calling thread until woken or `timeout` elapses
    ///
    /// Returns `true` if a wake token was consumed. Callers re-check for
    /// work either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked thread, or leave a token for the next `park`
    fn wake_one(&self);

    /// Wake every parked thread
    fn wake_all(&self);

    /// Number of currently parked threads (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = PlatformParking::new();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(30)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(parking.parked_count(), 0);
    }

    #[test]
    fn test_wake_before_park_is_not_lost() {
        let parking = PlatformParking::new();
        parking.wake_one();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        // Token is consumed
        assert!(!parking.park(Some(Duration::from_millis(5))));
    }

    #[test]
    fn test_wake_one_releases_parked_thread() {
        let parking = Arc::new(PlatformParking::new());
        let p2 = Arc::clone(&parking);
        let handle = thread::spawn(move || p2.park(Some(Duration::from_secs(10))));

        while parking.parked_count() == 0 {
            thread::yield_now();
        }
        parking.wake_one();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wake_all() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let parking = Arc::new(PlatformParking::new());
        let done = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let p = Arc::clone(&parking);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    p.park(Some(Duration::from_secs(10)));
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        while parking.parked_count() < 3 {
            thread::yield_now();
        }
        let start = Instant::now();
        // A sleeper that raced past the first token needs another one
        while done.load(Ordering::SeqCst) < 3 {
            parking.wake_all();
            thread::yield_now();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
