//! Fiber-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended lock parks the calling *fiber*
//! and lets its thread run other work. Waiters queue in FIFO order and the
//! unlocking fiber hands the lock directly to the oldest one, so a woken
//! waiter never has to compete for it again.
//!
//! Threads outside a runtime may use the same mutex; on contention they
//! spin and yield the OS thread.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::manager::Manager;
use crate::park::Parker;

/// Lock flag plus FIFO wait list, without data
pub struct RawFiberMutex {
    locked: AtomicBool,
    waiters: Mutex<VecDeque<Parker>>,
}

impl RawFiberMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, parking the current fiber while contended
    pub fn lock(&self) {
        if self.try_acquire() {
            return;
        }
        match Manager::current() {
            Some(manager) => self.lock_fiber(manager),
            None => self.lock_thread(),
        }
    }

    fn lock_fiber(&self, manager: &Manager) {
        // Returns with the lock held: either the retry below won, or the
        // unlocker handed the lock over before waking this fiber
        manager.park(|parker| {
            let mut waiters = self.waiters.lock();
            // Under the wait list lock no unlock can slip in between this
            // retry and the push
            if self.try_acquire() {
                return false;
            }
            waiters.push_back(parker);
            true
        });
    }

    fn lock_thread(&self) {
        let mut spins = 0u32;
        while !self.try_acquire() {
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    /// Release the lock, handing it to the oldest waiter if there is one
    ///
    /// # Safety
    ///
    /// The caller must hold the lock.
    pub unsafe fn unlock(&self) {
        let next = {
            let mut waiters = self.waiters.lock();
            let next = waiters.pop_front();
            if next.is_none() {
                self.locked.store(false, Ordering::Release);
            }
            next
        };
        // `locked` stays set: ownership moves to the woken fiber
        if let Some(parker) = next {
            parker.unpark();
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Parked fibers (hint)
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for RawFiberMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawFiberMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFiberMutex")
            .field("locked", &self.is_locked())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

/// Mutex protecting a `T`, parking fibers on contention
///
/// Not re-entrant: locking twice from one fiber deadlocks that fiber.
///
/// ```ignore
/// let counter = Arc::new(FiberMutex::new(0));
/// // In a fiber:
/// *counter.lock() += 1;
/// ```
pub struct FiberMutex<T: ?Sized> {
    raw: RawFiberMutex,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`
unsafe impl<T: ?Sized + Send> Send for FiberMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawFiberMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FiberMutex<T> {
    /// Acquire the lock; a contended fiber is parked until handed the lock
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        self.raw.lock();
        FiberMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        self.raw.try_lock().then(|| FiberMutexGuard { mutex: self })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn waiter_count(&self) -> usize {
        self.raw.waiter_count()
    }

    /// Exclusive access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("FiberMutex").field("data", &&*guard).finish(),
            None => f.debug_struct("FiberMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Releases the mutex when dropped
pub struct FiberMutexGuard<'a, T: ?Sized> {
    mutex: &'a FiberMutex<T>,
}

impl<T: ?Sized> Deref for FiberMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: the guard holds the lock
        unsafe { self.mutex.raw.unlock() };
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
