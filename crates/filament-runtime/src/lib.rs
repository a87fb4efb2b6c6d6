//! # filament-runtime
//!
//! The runtime half of the filament fiber library:
//! - Architecture-specific context switching (x86_64, aarch64)
//! - mmap-backed fiber stacks with guard pages
//! - The N:M scheduler and its use-caller mode
//! - Deadline timers
//! - The epoll reactor ([`IoManager`])
//! - Hooked socket syscalls that park fibers instead of blocking
//!
//! Linux only: the reactor is built on epoll.

#[cfg(not(target_os = "linux"))]
compile_error!("filament-runtime requires Linux (epoll)");

pub mod arch;
pub mod config;
pub mod fdmanager;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

// Re-exports
pub use fdmanager::{FdCtx, FdManager, TimeoutKind};
pub use fiber::{Fiber, FiberFn};
pub use hook::{is_hook_enabled, set_hook_enabled, sleep, sleep_ms, usleep};
pub use iomanager::{EventSet, IoManager};
pub use scheduler::{switch_to, Scheduler, SchedulerDriver, Task};
pub use stack::FiberStack;
pub use timer::{Timer, TimerCallback, TimerManager};
