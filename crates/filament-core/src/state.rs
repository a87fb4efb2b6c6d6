//! Fiber state machine

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a fiber
///
/// Legal transitions:
///
/// ```text
/// Init -> Ready -> Running -> { Ready, Suspend, Done, Except }
/// Suspend -> Ready -> Running
/// ```
///
/// `Running` never re-enters `Running` directly; `reset()` moves
/// `Done`/`Except`/`Init` back to `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created (or reset), body not yet entered
    Init = 0,

    /// Ready to run, queued or about to be queued
    Ready = 1,

    /// Currently executing on a worker thread
    Running = 2,

    /// Yielded away waiting for an event/timer; someone else resumes it
    Suspend = 3,

    /// Body returned normally
    Done = 4,

    /// Body panicked; caught at the trampoline boundary
    Except = 5,
}

impl FiberState {
    /// Check if this state allows the fiber to be scheduled
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has terminated
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Done | FiberState::Except)
    }

    /// Check if `reset()` is legal from this state
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Done | FiberState::Except
        )
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Suspend,
            4 => FiberState::Done,
            5 => FiberState::Except,
            _ => FiberState::Init,
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
            FiberState::Init => write!(f, "INIT"),
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Suspend => write!(f, "SUSPEND"),
            FiberState::Done => write!(f, "DONE"),
            FiberState::Except => write!(f, "EXCEPT"),
        }
    }
}

/// Atomic cell holding a `FiberState`
///
/// A fiber's state is read by other worker threads (the scheduler loop
/// inspects it after a switch returns), so it lives behind an atomic.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    #[inline]
    pub const fn new(state: FiberState) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> FiberState {
        FiberState::from(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: FiberState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Running.is_runnable());
        assert!(!FiberState::Suspend.is_runnable());

        assert!(FiberState::Done.is_terminated());
        assert!(FiberState::Except.is_terminated());
        assert!(!FiberState::Running.is_terminated());

        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Done.is_resettable());
        assert!(FiberState::Except.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
        assert!(!FiberState::Running.is_resettable());
        assert!(!FiberState::Suspend.is_resettable());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Running,
            FiberState::Suspend,
            FiberState::Done,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }

    #[test]
    fn test_atomic_state() {
        let state = AtomicState::new(FiberState::Init);
        assert_eq!(state.get(), FiberState::Init);
        state.set(FiberState::Running);
        assert_eq!(state.get(), FiberState::Running);
    }
}
