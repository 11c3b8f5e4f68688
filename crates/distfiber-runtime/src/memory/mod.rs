//! Fiber stack memory
//!
//! Each fiber owns one [`Stack`]: an anonymous mapping with a guard page
//! at its low end, so an overflow faults instead of corrupting a neighbour.
//! Finished fibers hand their stacks to a [`StackPool`] so the next spawn
//! with the same size skips the mmap/munmap pair.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::page_size;
    } else {
        compile_error!("distfiber stacks require a unix platform");
    }
}

use crossbeam_queue::ArrayQueue;
use distfiber_core::error::MemoryError;

/// An owned, guard-protected stack region
///
/// ```text
/// base                                           base + total
///  │ guard (PROT_NONE) │ usable stack ... grows down │
///                      ▲ bottom()                    ▲ top()
/// ```
pub struct Stack {
    base: *mut u8,
    total: usize,
    guard: usize,
}

// Safety: the mapping is exclusively owned by the Stack
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Usable size (without the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.total - self.guard
    }

    /// Exclusive upper end; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Lowest usable address (just above the guard page)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard) }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("size", &self.size())
            .finish()
    }
}

/// Round a requested stack size up to whole pages
pub fn round_to_pages(size: usize) -> Result<usize, MemoryError> {
    let page = page_size();
    size.checked_add(page - 1)
        .map(|s| s & !(page - 1))
        .ok_or(MemoryError::Overflow)
}

/// Bounded cache of released stacks, all of one size class
pub struct StackPool {
    size: usize,
    free: ArrayQueue<Stack>,
}

impl StackPool {
    /// Pool for stacks of `size` bytes (rounded to pages), caching at most
    /// `capacity` of them (at least one)
    pub fn new(size: usize, capacity: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            size: round_to_pages(size)?,
            free: ArrayQueue::new(capacity.max(1)),
        })
    }

    /// Size class served by this pool
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.size
    }

    /// Take a stack of at least `size` bytes, reusing a cached one when the
    /// size class matches
    pub fn acquire(&self, size: usize) -> Result<Stack, MemoryError> {
        let size = round_to_pages(size)?;
        if size == self.size {
            if let Some(stack) = self.free.pop() {
                return Ok(stack);
            }
        }
        Stack::new(size)
    }

    /// Return a stack; unmapped if the cache is full or the size differs
    pub fn release(&self, stack: Stack) {
        if stack.size() == self.size {
            // A full queue hands the stack back, dropping it unmaps
            let _ = self.free.push(stack);
        }
    }

    /// Number of cached stacks
    pub fn cached(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() {
        let stack = Stack::new(20_000).unwrap();
        let page = page_size();
        assert_eq!(stack.size() % page, 0);
        assert!(stack.size() >= 20_000);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024).unwrap();
        unsafe {
            let last = stack.top().sub(1);
            *last = 0xAB;
            *stack.bottom() = 0xCD;
            assert_eq!(*last, 0xAB);
            assert_eq!(*stack.bottom(), 0xCD);
        }
    }

    #[test]
    fn test_round_to_pages() {
        let page = page_size();
        assert_eq!(round_to_pages(1).unwrap(), page);
        assert_eq!(round_to_pages(page).unwrap(), page);
        assert_eq!(round_to_pages(usize::MAX), Err(MemoryError::Overflow));
    }

    #[test]
    fn test_pool_reuses_matching_size() {
        let pool = StackPool::new(32 * 1024, 2).unwrap();
        let stack = pool.acquire(32 * 1024).unwrap();
        let bottom = stack.bottom();
        pool.release(stack);
        assert_eq!(pool.cached(), 1);

        let again = pool.acquire(32 * 1024).unwrap();
        assert_eq!(again.bottom(), bottom);
        assert_eq!(pool.cached(), 0);

        // Different size class bypasses the cache
        let other = pool.acquire(64 * 1024).unwrap();
        pool.release(other);
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn test_pool_capacity_bound() {
        let pool = StackPool::new(16 * 1024, 1).unwrap();
        let a = pool.acquire(16 * 1024).unwrap();
        let b = pool.acquire(16 * 1024).unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.cached(), 1);
    }
}
