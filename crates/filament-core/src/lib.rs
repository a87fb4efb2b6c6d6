//! # filament-core
//!
//! Core types for the filament fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations are in `filament-runtime`.
//!
//! ## Modules
//!
//! - `id` - fiber identifier allocation
//! - `state` - fiber state machine
//! - `error` - error types
//! - `kprint` - kernel-style debug printing macros
//! - `env` - environment variable utilities

#![allow(dead_code)]

pub mod env;
pub mod error;
pub mod id;
pub mod kprint;
pub mod state;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
pub use error::{MemoryError, SchedError, SchedResult};
pub use id::{fiber_created, fiber_destroyed, total_fibers, FiberId};
pub use state::{AtomicState, FiberState};
