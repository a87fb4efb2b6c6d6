//! N:M fiber scheduler
//!
//! A [`Scheduler`] owns a pool of worker threads that pull tasks from a
//! shared queue. A task is either an existing fiber handle or a bare
//! callback, optionally pinned to a specific worker thread.
//!
//! With `use_caller` the calling thread itself becomes the last worker:
//! its scheduling loop runs on a dedicated root fiber that is entered
//! during [`Scheduler::stop`] and drains the queue before returning.
//!
//! Subsystems that need to hook the loop (an I/O reactor, for instance)
//! implement [`SchedulerDriver`] around an embedded `Scheduler` and
//! override `tickle`, `idle` and `stopping`.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use filament_core::{kdebug, kerror, kinfo, kprint, ktrace, FiberState, SchedError, SchedResult};

use crate::fiber::{Fiber, FiberFn};
use crate::tls;

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// Unit of scheduling: a fiber or a callback, with optional thread
/// affinity.
pub struct Task {
    kind: TaskKind,
    thread: Option<ThreadId>,
}

impl Task {
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            thread: None,
        }
    }

    pub fn call(cb: impl FnOnce() + Send + 'static) -> Task {
        Self::call_boxed(Box::new(cb))
    }

    pub(crate) fn call_boxed(cb: FiberFn) -> Task {
        Task {
            kind: TaskKind::Call(cb),
            thread: None,
        }
    }

    /// Pin this task to one worker thread. Other workers skip it and
    /// tickle so the owner wakes up.
    pub fn with_thread(mut self, thread: Option<ThreadId>) -> Task {
        self.thread = thread;
        self
    }
}

/// Seam between the generic scheduling loop and subsystems that drive it.
///
/// The loop calls `tickle` when work arrives, parks in `idle` when the
/// queue is empty and exits when `stopping` reports true. Implementors
/// embed a [`Scheduler`] and expose it through `scheduler()`.
pub trait SchedulerDriver: Send + Sync + 'static {
    fn scheduler(&self) -> &Scheduler;

    /// Upcast for runtime downcasting, e.g. recovering the concrete
    /// reactor type from the thread-local driver.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Wake idle workers. The base scheduler busy-polls, so this is a
    /// no-op; reactors override it to interrupt their wait.
    fn tickle(&self) {
        ktrace!("tickle {}", self.scheduler().name);
    }

    /// True once the scheduler may shut down: stop was requested, the
    /// queue is drained and no worker is mid-task.
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Body of the per-worker idle fiber. Runs whenever the queue is
    /// empty; must yield regularly and return once `stopping` is true.
    fn idle(&self) {
        ktrace!("idle {}", self.scheduler().name);
        while !self.stopping() {
            thread::yield_now();
            Fiber::yield_to_suspend();
        }
    }

    /// Called at the start of [`stop_driver`] before workers are joined.
    fn on_stop(&self) {}

    fn schedule_task(&self, task: Task) {
        let need_tickle = self.scheduler().enqueue(task);
        if need_tickle {
            self.tickle();
        }
    }
}

/// Shared scheduler state: the task queue, worker handles and counters.
pub struct Scheduler {
    name: String,
    thread_count: usize,
    use_caller: bool,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    root_thread: Mutex<Option<ThreadId>>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    // A scheduler starts out stopped; start() flips this.
    stopping: AtomicBool,
}

impl SchedulerDriver for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Scheduler {
    /// Create a scheduler with `threads` workers in total. With
    /// `use_caller` one of those workers is the thread that later calls
    /// [`stop`](Scheduler::stop).
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Scheduler {
        assert!(threads >= 1, "scheduler needs at least one thread");
        Scheduler {
            name: name.into(),
            thread_count: threads,
            use_caller,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            root_thread: Mutex::new(None),
            root_fiber: Mutex::new(None),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// The driver of the calling thread's scheduler, if the thread
    /// belongs to one.
    pub fn get_this() -> Option<Arc<dyn SchedulerDriver>> {
        tls::driver()
    }

    /// The fiber the calling thread's scheduling loop runs on.
    pub fn get_main_fiber() -> Option<Arc<Fiber>> {
        tls::sched_fiber()
    }

    /// Push a task; returns true when the queue was empty, meaning idle
    /// workers should be tickled.
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        let mut q = self.queue.lock().unwrap();
        let need_tickle = q.is_empty();
        q.push_back(task);
        need_tickle
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Schedule a callback.
    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static) {
        self.schedule_task(Task::call(cb));
    }

    /// Schedule an existing fiber, optionally pinned to a thread.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<ThreadId>) {
        self.schedule_task(Task::fiber(fiber).with_thread(thread));
    }

    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        let driver: Arc<dyn SchedulerDriver> = self.clone();
        start_driver(&driver)
    }

    pub fn stop(&self) {
        stop_driver(self);
    }
}

/// Start a scheduler's worker threads. Idempotent: a second call while
/// running is a no-op.
pub fn start_driver(driver: &Arc<dyn SchedulerDriver>) -> SchedResult<()> {
    let base = driver.scheduler();
    if !base.stopping.swap(false, Ordering::SeqCst) {
        return Ok(());
    }
    kinfo!(
        "scheduler {} starting, {} threads, use_caller={}",
        base.name,
        base.thread_count,
        base.use_caller
    );

    let spawn_count = if base.use_caller {
        base.thread_count - 1
    } else {
        base.thread_count
    };
    {
        let mut threads = base.threads.lock().unwrap();
        for worker_id in 0..spawn_count {
            let d = driver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", base.name, worker_id))
                .spawn(move || run(d, worker_id));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    kerror!("scheduler {} worker spawn failed: {}", base.name, e);
                    // Already-spawned workers drain and exit.
                    base.stopping.store(true, Ordering::SeqCst);
                    return Err(SchedError::SpawnFailed);
                }
            }
        }
    }

    if base.use_caller {
        // The caller participates through a root fiber that is entered
        // in stop() and runs the same loop as the workers.
        Fiber::get_this();
        tls::set_driver(driver.clone());
        *base.root_thread.lock().unwrap() = Some(thread::current().id());

        let weak = Arc::downgrade(driver);
        let root_worker = spawn_count;
        let root = Fiber::new_caller(
            move || {
                if let Some(d) = weak.upgrade() {
                    run(d, root_worker);
                }
            },
            0,
        );
        match root {
            Ok(root) => *base.root_fiber.lock().unwrap() = Some(root),
            Err(e) => {
                base.stopping.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Request shutdown, drain the queue and join the workers. With
/// `use_caller` this is where the caller thread does its share of the
/// work, on the root fiber.
pub fn stop_driver(driver: &dyn SchedulerDriver) {
    let base = driver.scheduler();
    driver.on_stop();
    base.stopping.store(true, Ordering::SeqCst);
    kinfo!("scheduler {} stopping", base.name);

    for _ in 0..base.thread_count {
        driver.tickle();
    }

    let root = base.root_fiber.lock().unwrap().take();
    if let Some(root) = root {
        if !root.state().is_terminated() {
            root.call();
        }
    }

    let handles = std::mem::take(&mut *base.threads.lock().unwrap());
    for handle in handles {
        let _ = handle.join();
    }
    kinfo!("scheduler {} stopped", base.name);
}

/// Reschedule the current fiber onto another thread of its scheduler.
/// No-op when already there or outside a scheduler.
pub fn switch_to(thread: Option<ThreadId>) {
    if let Some(driver) = tls::driver() {
        if thread.is_none() || thread == Some(thread::current().id()) {
            return;
        }
        driver.schedule_task(Task::fiber(Fiber::get_this()).with_thread(thread));
        Fiber::yield_to_suspend();
    }
}

/// Per-worker scheduling loop.
fn run(driver: Arc<dyn SchedulerDriver>, worker_id: usize) {
    kprint::set_worker_id(worker_id);
    tls::set_driver(driver.clone());
    crate::hook::set_hook_enabled(true);
    let base = driver.scheduler();
    kdebug!("worker {} of scheduler {} running", worker_id, base.name);

    // On a plain worker this wraps the OS thread stack; on a use_caller
    // root thread we are already inside the root fiber.
    let sched_fiber = Fiber::get_this();
    tls::set_sched_fiber(sched_fiber);

    let idle_driver = driver.clone();
    let idle_fiber = Fiber::new(move || idle_driver.idle(), 0).expect("failed to create idle fiber");
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut task: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut q = base.queue.lock().unwrap();
            let me = thread::current().id();
            let mut i = 0;
            while i < q.len() {
                // Skip tasks pinned to other threads, but make sure
                // their owner gets woken.
                if let Some(tid) = q[i].thread {
                    if tid != me {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                }
                // A fiber can be queued an instant before it finishes
                // switching out; leave it for a later pass.
                if let TaskKind::Fiber(ref f) = q[i].kind {
                    if f.state() == FiberState::Running {
                        i += 1;
                        continue;
                    }
                }
                task = q.remove(i);
                base.active_threads.fetch_add(1, Ordering::SeqCst);
                tickle_me |= i < q.len();
                break;
            }
        }
        if tickle_me {
            driver.tickle();
        }

        if let Some(task) = task {
            match task.kind {
                TaskKind::Fiber(f) => {
                    if f.state().is_terminated() {
                        base.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    f.swap_in();
                    kprint::clear_fiber_id();
                    base.active_threads.fetch_sub(1, Ordering::SeqCst);
                    if f.state() == FiberState::Ready {
                        driver.schedule_task(Task::fiber(f));
                    }
                    // Suspend: parked, whoever holds a handle resumes
                    // it. Done/Except: handle dropped here.
                }
                TaskKind::Call(cb) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => match Fiber::new(cb, 0) {
                            Ok(f) => f,
                            Err(e) => {
                                kerror!("worker {}: fiber allocation failed: {}", worker_id, e);
                                base.active_threads.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                    };
                    f.swap_in();
                    kprint::clear_fiber_id();
                    base.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        FiberState::Ready => driver.schedule_task(Task::fiber(f)),
                        FiberState::Suspend => {} // parked, handle held elsewhere
                        _ => cb_fiber = Some(f),  // finished, keep as scratch
                    }
                }
            }
        } else {
            if idle_fiber.state().is_terminated() {
                kdebug!("worker {} of scheduler {} exiting", worker_id, base.name);
                break;
            }
            base.idle_threads.fetch_add(1, Ordering::SeqCst);
            idle_fiber.swap_in();
            kprint::clear_fiber_id();
            base.idle_threads.fetch_sub(1, Ordering::SeqCst);
        }
    }

    tls::clear_sched_fiber();
    tls::clear_driver();
    kprint::clear_worker_id();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_callbacks_run_exactly_once() {
        let sched = Arc::new(Scheduler::new(4, false, "t-once"));
        sched.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let c = count.clone();
            sched.schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_ready_yield_requeues_fiber() {
        let sched = Arc::new(Scheduler::new(2, false, "t-yield"));
        sched.start().unwrap();
        let phases = Arc::new(AtomicUsize::new(0));
        let p = phases.clone();
        let fiber = Fiber::new(
            move || {
                p.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
                p.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();
        sched.schedule_fiber(fiber.clone(), None);
        sched.stop();
        assert_eq!(phases.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Done);
    }

    #[test]
    fn test_use_caller_runs_work_in_stop() {
        let sched = Arc::new(Scheduler::new(1, true, "t-caller"));
        sched.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let caller = thread::current().id();
        for _ in 0..10 {
            let c = count.clone();
            sched.schedule(move || {
                assert_eq!(thread::current().id(), caller);
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Nothing has run yet: the only worker is this thread.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_thread_affinity_respected() {
        let sched = Arc::new(Scheduler::new(4, false, "t-affinity"));
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        sched.schedule(move || {
            tx.send(thread::current().id()).unwrap();
        });
        let target = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        sched.schedule_task(
            Task::call(move || {
                tx.send(thread::current().id()).unwrap();
            })
            .with_thread(Some(target)),
        );
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on, target);
        sched.stop();
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let sched = Arc::new(Scheduler::new(2, false, "t-nostart"));
        sched.stop();
    }

    #[test]
    fn test_start_twice_is_noop() {
        let sched = Arc::new(Scheduler::new(2, false, "t-twice"));
        sched.start().unwrap();
        sched.start().unwrap();
        sched.stop();
    }

    #[test]
    fn test_panicking_callback_does_not_kill_worker() {
        let sched = Arc::new(Scheduler::new(1, false, "t-panic"));
        sched.start().unwrap();
        sched.schedule(|| panic!("task failure"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sched.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
