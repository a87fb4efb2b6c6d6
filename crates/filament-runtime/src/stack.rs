//! Per-fiber stack allocation using mmap
//!
//! Each fiber gets its own private anonymous mapping with a PROT_NONE
//! guard page at the low end, so running off the stack faults instead of
//! silently corrupting a neighbor.

use filament_core::MemoryError;

/// Guard page size. One page is enough to catch a runaway stack.
pub const GUARD_SIZE: usize = 4096;

const PAGE_SIZE: usize = 4096;

/// An owned, guard-protected fiber stack.
///
/// Stacks grow downward: [`top`](FiberStack::top) is where the stack
/// pointer starts, the guard page sits at the base of the mapping.
pub struct FiberStack {
    base: *mut u8,
    total_size: usize,
}

// The mapping is private to the owning fiber and only ever touched by
// the thread currently running that fiber.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a new stack of at least `size` usable bytes (rounded up to
    /// whole pages), plus the guard page.
    pub fn alloc(size: usize) -> Result<FiberStack, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let usable = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let total_size = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        // Guard page at the low end; the stack grows down toward it.
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total_size) };
            return Err(MemoryError::ProtectionFailed);
        }

        Ok(FiberStack {
            base: base as *mut u8,
            total_size,
        })
    }

    /// Highest address of the mapping, the initial stack pointer.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total_size) }
    }

    /// Usable stack bytes (mapping minus guard page).
    pub fn size(&self) -> usize {
        self.total_size - GUARD_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_to_pages() {
        let stack = FiberStack::alloc(1000).unwrap();
        assert_eq!(stack.size(), 4096);
        assert_eq!(stack.top() as usize % 4096, 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(FiberStack::alloc(0), Err(MemoryError::InvalidSize)));
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = FiberStack::alloc(64 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }
}
