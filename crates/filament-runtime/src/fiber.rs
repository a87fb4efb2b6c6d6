//! Stackful fibers
//!
//! A [`Fiber`] owns a mmap'd stack and a saved register image. Switching
//! is cooperative and explicit: the scheduler resumes a fiber with
//! [`swap_in`](Fiber::swap_in), the fiber gives the thread back with
//! [`yield_to_ready`](Fiber::yield_to_ready) or
//! [`yield_to_suspend`](Fiber::yield_to_suspend).
//!
//! The first call to [`Fiber::get_this`] on a thread lazily wraps the
//! thread's original stack in a stackless "main" fiber so there is always
//! a context to switch back to.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use filament_core::{kdebug, kerror, kprint, AtomicState, FiberId, FiberState, SchedError, SchedResult};

use crate::arch::{self, Context};
use crate::config;
use crate::stack::FiberStack;
use crate::tls;

/// Boxed fiber body.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// A cooperatively scheduled coroutine with its own stack.
///
/// Handles are `Arc<Fiber>`; the scheduler, I/O event slots and timers all
/// hold clones of the same handle.
pub struct Fiber {
    id: FiberId,
    state: AtomicState,
    stack: Option<FiberStack>,
    ctx: UnsafeCell<Context>,
    cb: UnsafeCell<Option<FiberFn>>,
    /// Root fiber of a use-caller scheduler. Its terminal switch targets
    /// the thread fiber instead of the scheduler fiber.
    caller: bool,
}

// state is atomic; ctx and cb are only touched by the thread that
// currently owns the fiber (it is either running on exactly one thread
// or parked in exactly one queue/slot).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `cb` when first resumed.
    ///
    /// `stack_size` of 0 uses [`config::default_stack_size`].
    pub fn new(cb: impl FnOnce() + Send + 'static, stack_size: usize) -> SchedResult<Arc<Fiber>> {
        Self::build(Box::new(cb), stack_size, false)
    }

    /// Create the root fiber of a use-caller scheduler. Identical to
    /// [`new`](Fiber::new) except its final switch returns to the caller
    /// thread's own fiber.
    pub fn new_caller(cb: impl FnOnce() + Send + 'static, stack_size: usize) -> SchedResult<Arc<Fiber>> {
        Self::build(Box::new(cb), stack_size, true)
    }

    fn build(cb: FiberFn, stack_size: usize, caller: bool) -> SchedResult<Arc<Fiber>> {
        let size = if stack_size == 0 {
            config::default_stack_size()
        } else {
            stack_size
        };
        let stack = FiberStack::alloc(size).map_err(SchedError::MemoryError)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicState::new(FiberState::Init),
            stack: Some(stack),
            ctx: UnsafeCell::new(Context::new()),
            cb: UnsafeCell::new(Some(cb)),
            caller,
        });
        filament_core::fiber_created();

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        kdebug!("fiber {} created, stack {} bytes", fiber.id, size);
        Ok(fiber)
    }

    /// Wrap the calling thread's original stack in a fiber. No stack is
    /// allocated and no body is attached; it exists as a switch target.
    fn new_main() -> Arc<Fiber> {
        filament_core::fiber_created();
        Arc::new(Fiber {
            id: FiberId::MAIN,
            state: AtomicState::new(FiberState::Running),
            stack: None,
            ctx: UnsafeCell::new(Context::new()),
            cb: UnsafeCell::new(None),
            caller: false,
        })
    }

    /// The fiber currently running on this thread, creating the thread's
    /// main fiber on first use.
    pub fn get_this() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = Fiber::new_main();
        tls::set_thread_fiber(main.clone());
        tls::set_current_fiber(main.clone());
        kdebug!("main fiber created for thread");
        main
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.set(state);
    }

    /// Re-arm a finished fiber with a new body, reusing its stack.
    ///
    /// Panics if called on a main fiber or while the previous body has not
    /// finished.
    pub fn reset(self: &Arc<Self>, cb: impl FnOnce() + Send + 'static) {
        assert!(self.stack.is_some(), "cannot reset a main fiber");
        let state = self.state.get();
        assert!(
            state.is_resettable(),
            "fiber {} reset while {}",
            self.id,
            state
        );
        unsafe {
            *self.cb.get() = Some(Box::new(cb));
            arch::init_context(
                self.ctx.get(),
                self.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.state.set(FiberState::Init);
    }

    /// Resume this fiber from the scheduler fiber.
    ///
    /// Returns when the fiber yields or finishes.
    pub fn swap_in(self: &Arc<Self>) {
        let from = tls::sched_fiber()
            .or_else(tls::thread_fiber)
            .expect("swap_in with no fiber context on this thread");
        let state = self.state.get();
        assert_ne!(state, FiberState::Running, "fiber {} resumed while running", self.id);
        assert!(!state.is_terminated(), "fiber {} resumed after {}", self.id, state);

        tls::set_current_fiber(self.clone());
        kprint::set_fiber_id(self.id.as_u64());
        self.state.set(FiberState::Running);
        unsafe {
            arch::context_switch(from.ctx.get(), self.ctx.get());
        }
    }

    /// Switch from this fiber back to the scheduler fiber (or the thread
    /// fiber outside a scheduler).
    pub fn swap_out(&self) {
        let to = tls::sched_fiber()
            .or_else(tls::thread_fiber)
            .expect("swap_out with no fiber context on this thread");
        tls::set_current_fiber(to.clone());
        unsafe {
            arch::context_switch(self.ctx.get(), to.ctx.get());
        }
    }

    /// Resume this fiber directly from the thread fiber, bypassing the
    /// scheduler fiber slot. Used to run a use-caller root fiber.
    pub fn call(self: &Arc<Self>) {
        let from = tls::thread_fiber().expect("call() before the thread fiber exists");
        let state = self.state.get();
        assert_ne!(state, FiberState::Running, "fiber {} called while running", self.id);
        assert!(!state.is_terminated(), "fiber {} called after {}", self.id, state);

        tls::set_current_fiber(self.clone());
        kprint::set_fiber_id(self.id.as_u64());
        self.state.set(FiberState::Running);
        unsafe {
            arch::context_switch(from.ctx.get(), self.ctx.get());
        }
    }

    /// Switch from this fiber back to the thread fiber. Counterpart of
    /// [`call`](Fiber::call).
    pub fn back(&self) {
        let to = tls::thread_fiber().expect("back() before the thread fiber exists");
        tls::set_current_fiber(to.clone());
        unsafe {
            arch::context_switch(self.ctx.get(), to.ctx.get());
        }
    }

    /// Yield the current fiber and mark it ready to run again. The
    /// scheduler requeues it.
    pub fn yield_to_ready() {
        let cur = Fiber::get_this();
        assert_eq!(cur.state.get(), FiberState::Running);
        cur.state.set(FiberState::Ready);
        cur.swap_out();
    }

    /// Yield the current fiber without requeueing it. Something else (a
    /// timer, an I/O event) must hold a handle and reschedule it.
    pub fn yield_to_suspend() {
        let cur = Fiber::get_this();
        assert_eq!(cur.state.get(), FiberState::Running);
        cur.state.set(FiberState::Suspend);
        cur.swap_out();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        filament_core::fiber_destroyed();
        if self.stack.is_some() {
            debug_assert_ne!(
                self.state.get(),
                FiberState::Running,
                "fiber {} dropped while running",
                self.id
            );
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("main", &self.stack.is_none())
            .finish()
    }
}

/// Entry point every fiber starts in. Runs the body, records the outcome
/// and switches away for the last time.
extern "C" fn fiber_entry(fiber_ptr: usize) {
    let fiber = unsafe { &*(fiber_ptr as *const Fiber) };
    let cb = unsafe { (*fiber.cb.get()).take() };

    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        (cb.expect("fiber entered without a body"))();
    }));
    match result {
        Ok(()) => fiber.state.set(FiberState::Done),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            kerror!("fiber {} panicked: {}", fiber.id, msg);
            fiber.state.set(FiberState::Except);
        }
    }

    // Final switch away. The handle that scheduled us drops the fiber.
    if fiber.caller {
        fiber.back();
    } else {
        fiber.swap_out();
    }
    unreachable!("finished fiber {} was resumed", fiber.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fiber_runs_to_completion() {
        Fiber::get_this();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
        )
        .unwrap();
        assert_eq!(f.state(), FiberState::Init);
        f.call();
        assert_eq!(f.state(), FiberState::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fiber_body_keeps_stack_alignment() {
        // Floating-point math plus formatting forces 16-byte-aligned
        // SSE spills, which fault if the entry stack is misaligned.
        Fiber::get_this();
        let out = Arc::new(std::sync::Mutex::new(String::new()));
        let o = out.clone();
        let f = Fiber::new(
            move || {
                let mut sum = 0.0f64;
                for i in 1..=64 {
                    sum += (i as f64).sqrt();
                }
                *o.lock().unwrap() = format!("{:.3}", sum);
            },
            16 * 1024,
        )
        .unwrap();
        f.call();
        assert_eq!(f.state(), FiberState::Done);
        assert!(!out.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fiber_yield_and_resume() {
        Fiber::get_this();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
                h.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
        )
        .unwrap();
        f.call();
        assert_eq!(f.state(), FiberState::Ready);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        f.call();
        assert_eq!(f.state(), FiberState::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fiber_reset_reruns_on_same_stack() {
        Fiber::get_this();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
        )
        .unwrap();
        f.call();
        assert_eq!(f.state(), FiberState::Done);

        let h = hits.clone();
        f.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(f.state(), FiberState::Init);
        f.call();
        assert_eq!(f.state(), FiberState::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panic_marks_fiber_except() {
        Fiber::get_this();
        // Default stack size: unwinding needs more room than a tiny
        // test stack provides.
        let f = Fiber::new(
            || {
                panic!("boom");
            },
            0,
        )
        .unwrap();
        f.call();
        assert_eq!(f.state(), FiberState::Except);
        // An excepted fiber can be re-armed.
        let ok = Arc::new(AtomicUsize::new(0));
        let o = ok.clone();
        f.reset(move || {
            o.fetch_add(1, Ordering::SeqCst);
        });
        f.call();
        assert_eq!(f.state(), FiberState::Done);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_main_fiber_identity() {
        let a = Fiber::get_this();
        let b = Fiber::get_this();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), FiberId::MAIN);
        assert_eq!(a.state(), FiberState::Running);
    }

    #[test]
    fn test_suspend_yield_leaves_fiber_parked() {
        Fiber::get_this();
        let f = Fiber::new(
            || {
                Fiber::yield_to_suspend();
            },
            16 * 1024,
        )
        .unwrap();
        f.call();
        assert_eq!(f.state(), FiberState::Suspend);
        f.call();
        assert_eq!(f.state(), FiberState::Done);
    }
}
