//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a fiber
///
/// Id 0 is reserved for a thread's main fiber.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// The main fiber of any thread
    pub const MAIN: FiberId = FiberId(0);

    /// Allocate the next fiber id
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bump the live-fiber counter (called on fiber construction)
#[inline]
pub fn fiber_created() {
    LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
}

/// Drop the live-fiber counter (called on fiber destruction)
#[inline]
pub fn fiber_destroyed() {
    LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
}

/// Number of fibers currently alive in the process
#[inline]
pub fn total_fibers() -> u64 {
    LIVE_FIBERS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_main_sentinel() {
        assert!(FiberId::MAIN.is_main());
        assert!(!FiberId::new(7).is_main());
    }

    #[test]
    fn test_live_counter() {
        let before = total_fibers();
        fiber_created();
        assert_eq!(total_fibers(), before + 1);
        fiber_destroyed();
        assert_eq!(total_fibers(), before);
    }
}
