//! # filament - stackful coroutines over epoll
//!
//! Cooperative fiber runtime for Linux. Fibers are stackful coroutines
//! multiplexed over a pool of worker threads; the I/O reactor turns
//! blocking socket calls into fiber suspensions, so straight-line code
//! scales to thousands of concurrent connections.
//!
//! ## Quick start
//!
//! ```no_run
//! use filament::{hook, IoManager};
//!
//! fn main() -> std::io::Result<()> {
//!     // 2 worker threads, reactor included.
//!     let iom = IoManager::new(2, false, "demo")?;
//!
//!     iom.schedule(|| {
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
//!         let addr = "127.0.0.1:8080".parse().unwrap();
//!         if hook::connect(fd, &addr).is_ok() {
//!             // Looks blocking, never blocks the worker: the fiber
//!             // parks on the reactor until data arrives.
//!             let mut buf = [0u8; 1024];
//!             let n = hook::read(fd, &mut buf).unwrap();
//!             println!("got {} bytes", n);
//!         }
//!         let _ = hook::close(fd);
//!     });
//!
//!     iom.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! - [`Fiber`]: stackful coroutine, assembly context switch, mmap stack
//!   with a guard page
//! - [`Scheduler`]: N:M queue of fibers and callbacks over worker
//!   threads, optional use-caller mode
//! - [`TimerManager`]: deadline timers driving the reactor's wait
//! - [`IoManager`]: epoll reactor in the scheduler's idle loop
//! - [`hook`]: blocking-style socket calls that suspend the fiber
//!   instead of the thread

pub use filament_core::{
    env_get, env_get_bool, env_get_opt, env_get_str, kprint, FiberId, FiberState, MemoryError,
    SchedError, SchedResult,
};
pub use filament_runtime::{
    config, fdmanager, hook, iomanager, scheduler, timer, EventSet, FdCtx, FdManager, Fiber,
    FiberStack, IoManager, Scheduler, SchedulerDriver, Task, Timer, TimerCallback, TimerManager,
    TimeoutKind,
};

// Macros re-exported at the crate root.
pub use filament_core::{kdebug, kerror, kinfo, ktrace, kwarn};
