//! Thread-local runtime state
//!
//! Each worker thread tracks the fiber it is currently running, the fiber
//! that owns the thread's original stack, the fiber the scheduler loop
//! runs on, and the scheduler driving the thread.
//!
//! Accessors clone the `Arc` out and drop the `RefCell` borrow before
//! returning, so no borrow is ever held across a context switch.

use std::cell::RefCell;
use std::sync::Arc;

use crate::fiber::Fiber;
use crate::scheduler::SchedulerDriver;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static DRIVER: RefCell<Option<Arc<dyn SchedulerDriver>>> = const { RefCell::new(None) };
}

/// Fiber currently executing on this thread, if any.
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|f| f.borrow().clone())
}

pub fn set_current_fiber(fiber: Arc<Fiber>) {
    CURRENT_FIBER.with(|f| *f.borrow_mut() = Some(fiber));
}

/// The fiber wrapping this thread's original stack.
pub fn thread_fiber() -> Option<Arc<Fiber>> {
    THREAD_FIBER.with(|f| f.borrow().clone())
}

pub fn set_thread_fiber(fiber: Arc<Fiber>) {
    THREAD_FIBER.with(|f| *f.borrow_mut() = Some(fiber));
}

/// The fiber the scheduler loop runs on. On plain workers this is the
/// thread fiber; on a use-caller root thread it is the root fiber.
pub fn sched_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|f| f.borrow().clone())
}

pub fn set_sched_fiber(fiber: Arc<Fiber>) {
    SCHED_FIBER.with(|f| *f.borrow_mut() = Some(fiber));
}

pub fn clear_sched_fiber() {
    SCHED_FIBER.with(|f| *f.borrow_mut() = None);
}

/// Scheduler driving this thread, if it belongs to one.
pub fn driver() -> Option<Arc<dyn SchedulerDriver>> {
    DRIVER.with(|d| d.borrow().clone())
}

pub fn set_driver(driver: Arc<dyn SchedulerDriver>) {
    DRIVER.with(|d| *d.borrow_mut() = Some(driver));
}

pub fn clear_driver() {
    DRIVER.with(|d| *d.borrow_mut() = None);
}
