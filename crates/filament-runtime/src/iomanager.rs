//! epoll-backed I/O reactor
//!
//! [`IoManager`] embeds a [`Scheduler`] and replaces its busy idle loop
//! with an `epoll_wait` sized by the earliest timer deadline. Fibers (or
//! callbacks) park on per-fd event slots; when the kernel reports
//! readiness the slot is fired exactly once and the continuation goes
//! back through the normal scheduling queue.
//!
//! All registrations are edge-triggered and one-shot by construction:
//! firing an event removes it from the interest set, re-arming is the
//! caller's job.

use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use filament_core::{kdebug, kerror, ktrace};

use crate::fiber::{Fiber, FiberFn};
use crate::scheduler::{self, Scheduler, SchedulerDriver, Task};
use crate::timer::{Timer, TimerManager};
use crate::tls;

/// I/O readiness interest, a subset of the epoll event mask.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(libc::EPOLLIN as u32);
    pub const WRITE: EventSet = EventSet(libc::EPOLLOUT as u32);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn insert(&mut self, other: EventSet) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: EventSet) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for EventSet {
    type Output = EventSet;
    fn bitand(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 & rhs.0)
    }
}

impl std::fmt::Debug for EventSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

/// Continuation parked on one readiness direction of one fd.
#[derive(Default)]
struct EventSlot {
    /// Scheduler the continuation should resume on. Weak so a parked
    /// event cannot keep a dead scheduler alive.
    driver: Option<Weak<dyn SchedulerDriver>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

struct FdInner {
    events: EventSet,
    read: EventSlot,
    write: EventSlot,
}

impl FdInner {
    fn slot_mut(&mut self, event: EventSet) -> &mut EventSlot {
        if event == EventSet::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

/// Per-fd registration state. The vector of these grows and never
/// shrinks, so an `Arc<FdContext>` stays valid for the fd's lifetime.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: EventSet::NONE,
                read: EventSlot::default(),
                write: EventSlot::default(),
            }),
        }
    }
}

const MAX_EVENTS: usize = 256;
/// Ceiling on a single epoll wait, so shutdown and newly armed timers
/// are noticed even without a tickle.
const MAX_TIMEOUT_MS: u64 = 3000;

/// Scheduler with an epoll reactor and timer wheel in its idle loop.
pub struct IoManager {
    sched: Scheduler,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl IoManager {
    /// Create the reactor and start its worker threads.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> io::Result<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut pipe_fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(err);
        }

        let iom = Arc::new(IoManager {
            sched: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
        });
        grow(&mut iom.fd_contexts.write().unwrap(), 32);

        // A timer landing at the front of the wheel must shorten an
        // in-flight epoll wait.
        let weak = Arc::downgrade(&iom);
        iom.timers.set_front_notify(move || {
            if let Some(m) = weak.upgrade() {
                m.tickle_write();
            }
        });

        let driver: Arc<dyn SchedulerDriver> = iom.clone();
        scheduler::start_driver(&driver).map_err(io::Error::other)?;
        Ok(iom)
    }

    /// The reactor driving the calling thread, if any.
    pub fn get_this() -> Option<Arc<IoManager>> {
        let driver = tls::driver()?;
        driver.into_any().downcast::<IoManager>().ok()
    }

    /// Drain the queue, join the workers and fire remaining events.
    pub fn stop(&self) {
        scheduler::stop_driver(self);
    }

    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static) {
        self.schedule_task(Task::call(cb));
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<std::thread::ThreadId>) {
        self.schedule_task(Task::fiber(fiber).with_thread(thread));
    }

    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: impl Fn() -> bool + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn timer_manager(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Arm `event` (exactly one of READ or WRITE) on `fd`.
    ///
    /// With a callback the callback is scheduled on readiness; without
    /// one the current fiber is parked in the slot and the caller is
    /// expected to yield to suspend right after.
    ///
    /// Panics if the event is already armed: two fibers waiting on the
    /// same direction of the same fd is a caller bug.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, event: EventSet, cb: Option<FiberFn>) -> io::Result<()> {
        assert!(
            event == EventSet::READ || event == EventSet::WRITE,
            "add_event takes a single event, got {:?}",
            event
        );
        let ctx = self.fd_context(fd);
        let mut inner = ctx.inner.lock().unwrap();
        assert!(
            !inner.events.contains(event),
            "{:?} already armed on fd {}",
            event,
            fd
        );

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.events.bits() | event.bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            kerror!("epoll_ctl({}, {:?}) failed: {}", fd, event, err);
            return Err(err);
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events.insert(event);
        let driver = tls::driver().unwrap_or_else(|| self.clone() as Arc<dyn SchedulerDriver>);
        let slot = inner.slot_mut(event);
        slot.driver = Some(Arc::downgrade(&driver));
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let cur = Fiber::get_this();
                slot.fiber = Some(cur);
            }
        }
        ktrace!("armed {:?} on fd {}", event, fd);
        Ok(())
    }

    /// Disarm `event` on `fd` without firing its continuation.
    pub fn del_event(&self, fd: RawFd, event: EventSet) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }
        if !self.rearm_remainder(&ctx, &inner, event) {
            return false;
        }
        inner.events.remove(event);
        *inner.slot_mut(event) = EventSlot::default();
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm `event` on `fd` and fire its continuation now, as if the
    /// fd had become ready. Used by timeouts and `close`.
    pub fn cancel_event(&self, fd: RawFd, event: EventSet) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }
        if !self.rearm_remainder(&ctx, &inner, event) {
            return false;
        }
        self.trigger(&mut inner, event);
        true
    }

    /// Cancel and fire everything armed on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret != 0 {
            kerror!("epoll_ctl(DEL, {}) failed: {}", fd, io::Error::last_os_error());
            return false;
        }
        if inner.events.contains(EventSet::READ) {
            self.trigger(&mut inner, EventSet::READ);
        }
        if inner.events.contains(EventSet::WRITE) {
            self.trigger(&mut inner, EventSet::WRITE);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Update the kernel interest set to everything armed except
    /// `event`.
    fn rearm_remainder(&self, ctx: &FdContext, inner: &FdInner, event: EventSet) -> bool {
        let left = inner.events.bits() & !event.bits();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left,
            u64: ctx.fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd, &mut ev) };
        if ret != 0 {
            kerror!("epoll_ctl({}) failed: {}", ctx.fd, io::Error::last_os_error());
            return false;
        }
        true
    }

    /// Detach the continuation for `event` and push it onto its
    /// scheduler's queue.
    fn trigger(&self, inner: &mut FdInner, event: EventSet) {
        assert!(inner.events.contains(event));
        inner.events.remove(event);
        let slot = inner.slot_mut(event);
        let driver = slot.driver.take().and_then(|w| w.upgrade());
        let task = if let Some(cb) = slot.cb.take() {
            slot.fiber = None;
            Some(Task::call_boxed(cb))
        } else {
            slot.fiber.take().map(Task::fiber)
        };
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        if let Some(task) = task {
            match driver {
                Some(d) => d.schedule_task(task),
                None => self.schedule_task(task),
            }
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        let idx = fd as usize;
        {
            let ctxs = self.fd_contexts.read().unwrap();
            if idx < ctxs.len() {
                return ctxs[idx].clone();
            }
        }
        let mut ctxs = self.fd_contexts.write().unwrap();
        if idx >= ctxs.len() {
            let new_len = std::cmp::max(idx + 1, idx * 3 / 2);
            grow(&mut ctxs, new_len);
        }
        ctxs[idx].clone()
    }

    fn tickle_write(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let ret = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        if ret != 1 {
            ktrace!("tickle write returned {}", ret);
        }
    }

    fn stopping_with_timeout(&self, next_timeout: u64) -> bool {
        next_timeout == u64::MAX
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }
}

impl SchedulerDriver for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn tickle(&self) {
        self.tickle_write();
    }

    fn stopping(&self) -> bool {
        self.stopping_with_timeout(self.timers.get_next_timer())
    }

    fn on_stop(&self) {
        self.timers.close_recurring_timers();
    }

    /// Reactor loop, run on each worker's idle fiber.
    fn idle(&self) {
        kdebug!("reactor {} idle loop entered", self.sched.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let next_timeout = self.timers.get_next_timer();
            if self.stopping_with_timeout(next_timeout) {
                kdebug!("reactor {} idle loop exiting", self.sched.name());
                break;
            }

            let n = loop {
                let timeout = next_timeout.min(MAX_TIMEOUT_MS) as i32;
                let ret = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    kerror!("epoll_wait failed: {}", err);
                    break 0;
                }
                break ret;
            };

            for cb in self.timers.list_expired_callbacks() {
                self.schedule_task(Task::call(move || cb()));
            }

            for ev in events.iter_mut().take(n as usize) {
                if ev.u64 == self.tickle_fds[0] as u64 {
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    } > 0
                    {}
                    continue;
                }

                let fd = ev.u64 as RawFd;
                let Some(ctx) = self.lookup(fd) else { continue };
                let mut inner = ctx.inner.lock().unwrap();

                // An error or hangup must wake whatever is parked on the
                // fd, whichever direction it was waiting for.
                let mut revents = ev.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
                }
                let mut real = EventSet::NONE;
                if revents & libc::EPOLLIN as u32 != 0 {
                    real.insert(EventSet::READ);
                }
                if revents & libc::EPOLLOUT as u32 != 0 {
                    real.insert(EventSet::WRITE);
                }
                real = real & inner.events;
                if real.is_empty() {
                    continue;
                }

                // Keep the directions that did not fire armed.
                let left = inner.events.bits() & !real.bits();
                let op = if left != 0 {
                    libc::EPOLL_CTL_MOD
                } else {
                    libc::EPOLL_CTL_DEL
                };
                let mut rearm = libc::epoll_event {
                    events: libc::EPOLLET as u32 | left,
                    u64: fd as u64,
                };
                let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut rearm) };
                if ret != 0 {
                    kerror!("epoll_ctl({}) failed: {}", fd, io::Error::last_os_error());
                    continue;
                }

                if real.contains(EventSet::READ) {
                    self.trigger(&mut inner, EventSet::READ);
                }
                if real.contains(EventSet::WRITE) {
                    self.trigger(&mut inner, EventSet::WRITE);
                }
            }

            // Hand the thread back to the scheduling loop so freshly
            // queued continuations run.
            Fiber::yield_to_suspend();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

fn grow(ctxs: &mut Vec<Arc<FdContext>>, new_len: usize) {
    let mut fd = ctxs.len() as RawFd;
    ctxs.resize_with(new_len, || {
        let ctx = Arc::new(FdContext::new(fd));
        fd += 1;
        ctx
    });
}
