//! Unix stack mapping using mmap

use super::{round_to_pages, Stack};
use distfiber_core::error::MemoryError;
use std::sync::OnceLock;

/// System page size (cached)
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret <= 0 { 4096 } else { ret as usize }
    })
}

impl Stack {
    /// Map a stack with at least `size` usable bytes plus one guard page
    pub fn new(size: usize) -> Result<Stack, MemoryError> {
        let usable = round_to_pages(size)?;
        let guard = page_size();
        let total = usable.checked_add(guard).ok_or(MemoryError::Overflow)?;

        // Physical pages are committed on first touch
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        // Stack grows down: the guard sits at the lowest address
        let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(MemoryError::ProtectionFailed);
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
            guard,
        })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}
