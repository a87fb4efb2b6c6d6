//! Runtime tunables
//!
//! Values are seeded from `FILAMENT_*` environment variables on first use.
//! The connect timeout can additionally be changed at runtime, which takes
//! effect for subsequent hooked `connect` calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use filament_core::env_get;

/// Sentinel meaning "no timeout".
pub const NO_TIMEOUT: u64 = u64::MAX;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_STACK_SIZE: usize = 128 * 1024;

fn connect_timeout_cell() -> &'static AtomicU64 {
    static CELL: OnceLock<AtomicU64> = OnceLock::new();
    CELL.get_or_init(|| {
        AtomicU64::new(env_get(
            "FILAMENT_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
        ))
    })
}

/// Timeout applied to hooked `connect` calls, in milliseconds.
/// [`NO_TIMEOUT`] disables it.
pub fn connect_timeout_ms() -> u64 {
    connect_timeout_cell().load(Ordering::Relaxed)
}

/// Change the connect timeout at runtime.
pub fn set_connect_timeout_ms(ms: u64) {
    connect_timeout_cell().store(ms, Ordering::Relaxed);
}

/// Stack size for fibers created with a size of 0, in bytes.
///
/// Seeded from `FILAMENT_STACK_SIZE`, defaults to 128 KiB.
pub fn default_stack_size() -> usize {
    static CELL: OnceLock<usize> = OnceLock::new();
    *CELL.get_or_init(|| env_get("FILAMENT_STACK_SIZE", DEFAULT_STACK_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_reload() {
        let before = connect_timeout_ms();
        set_connect_timeout_ms(250);
        assert_eq!(connect_timeout_ms(), 250);
        set_connect_timeout_ms(before);
    }

    #[test]
    fn test_default_stack_size_sane() {
        assert!(default_stack_size() >= 4096);
    }
}
