//! Error types for the fiber runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler/runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Stack allocation/mapping failed
    MemoryError(MemoryError),

    /// Failed to spawn a worker thread
    SpawnFailed,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::MemoryError(e) => write!(f, "memory error: {}", e),
            SchedError::SpawnFailed => write!(f, "failed to spawn worker thread"),
        }
    }
}

impl std::error::Error for SchedError {}

/// Stack-memory related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect failed (guard page setup)
    ProtectionFailed,

    /// Requested stack size is invalid
    InvalidSize,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::InvalidSize => write!(f, "invalid stack size"),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::MemoryError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::SpawnFailed;
        assert_eq!(format!("{}", e), "failed to spawn worker thread");

        let e = SchedError::MemoryError(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: stack allocation failed");
    }

    #[test]
    fn test_error_conversion() {
        let mem_err = MemoryError::ProtectionFailed;
        let sched_err: SchedError = mem_err.into();
        assert!(matches!(
            sched_err,
            SchedError::MemoryError(MemoryError::ProtectionFailed)
        ));
    }
}
