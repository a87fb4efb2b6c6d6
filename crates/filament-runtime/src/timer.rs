//! Deadline timers
//!
//! [`TimerManager`] keeps timers in a set ordered by absolute deadline,
//! with the handle's address as tiebreaker so timers sharing a deadline
//! coexist. The owner (the I/O reactor) polls
//! [`get_next_timer`](TimerManager::get_next_timer) to size its wait and
//! harvests due callbacks with
//! [`list_expired_callbacks`](TimerManager::list_expired_callbacks).
//!
//! Inserting a timer that becomes the new earliest deadline fires the
//! front-notify hook so the owner can shorten an in-flight wait. A
//! `tickled` latch collapses repeated notifications between two polls.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Instant;

use filament_core::kdebug;

/// Shared timer callback. Cloned out of the set on expiry, so a slow
/// callback never holds the timer lock.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Milliseconds since the runtime clock's origin.
pub fn now_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// A scheduled timer. Handles stay valid after expiry; `cancel`,
/// `refresh` and `reset` operate through the owning manager.
pub struct Timer {
    period_ms: AtomicU64,
    /// Absolute deadline on the runtime clock. Only mutated while the
    /// timer is out of the manager's set.
    next_ms: AtomicU64,
    recurring: bool,
    cb: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Remove the timer. Returns false if it already fired or was
    /// cancelled.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.timers.write().unwrap();
        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&TimerEntry(self.clone()))
    }

    /// Push the deadline out to now + period. Returns false if the timer
    /// is no longer pending.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.timers.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        if !timers.remove(&TimerEntry(self.clone())) {
            return false;
        }
        self.next_ms
            .store(now_ms() + self.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        timers.insert(TimerEntry(self.clone()));
        true
    }

    /// Change the period. With `from_now` the new deadline is
    /// now + `ms`; otherwise the original start point is kept and the
    /// timer may become the earliest deadline, notifying the owner.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        if ms == self.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut timers = manager.timers.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            if !timers.remove(&TimerEntry(self.clone())) {
                return false;
            }
            let old_next = self.next_ms.load(Ordering::Relaxed);
            let old_period = self.period_ms.load(Ordering::Relaxed);
            let start = if from_now {
                now_ms()
            } else {
                old_next - old_period
            };
            self.period_ms.store(ms, Ordering::Relaxed);
            self.next_ms.store(start + ms, Ordering::Relaxed);
            if from_now {
                timers.insert(TimerEntry(self.clone()));
                at_front = false;
            } else {
                at_front = manager.insert_locked(&mut timers, TimerEntry(self.clone()));
            }
        }
        if at_front {
            manager.notify_front();
        }
        true
    }
}

/// Set entry ordering timers by (deadline, handle address).
struct TimerEntry(Arc<Timer>);

impl TimerEntry {
    fn key(&self) -> (u64, usize) {
        (
            self.0.next_ms.load(Ordering::Relaxed),
            Arc::as_ptr(&self.0) as usize,
        )
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Owner of pending timers. Usually embedded in the I/O reactor, but
/// usable standalone.
pub struct TimerManager {
    timers: RwLock<BTreeSet<TimerEntry>>,
    tickled: AtomicBool,
    close_recurring: AtomicBool,
    front_notify: Mutex<Option<Box<dyn Fn() + Send + Sync + 'static>>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            timers: RwLock::new(BTreeSet::new()),
            tickled: AtomicBool::new(false),
            close_recurring: AtomicBool::new(false),
            front_notify: Mutex::new(None),
        })
    }

    /// Install the hook invoked when an insert produces a new earliest
    /// deadline. The reactor uses this to interrupt its epoll wait.
    pub fn set_front_notify(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.front_notify.lock().unwrap() = Some(Box::new(hook));
    }

    /// Schedule `cb` to run in `ms` milliseconds. A recurring timer
    /// re-arms itself after each expiry.
    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer_cb(ms, Arc::new(cb), recurring)
    }

    fn add_timer_cb(self: &Arc<Self>, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            period_ms: AtomicU64::new(ms),
            next_ms: AtomicU64::new(now_ms() + ms),
            recurring,
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(self),
        });
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            self.insert_locked(&mut timers, TimerEntry(timer.clone()))
        };
        if at_front {
            self.notify_front();
        }
        timer
    }

    /// Like [`add_timer`](TimerManager::add_timer), but the callback only
    /// runs while `cond` still reports true at expiry.
    pub fn add_condition_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: impl Fn() -> bool + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer_cb(
            ms,
            Arc::new(move || {
                if cond() {
                    cb();
                }
            }),
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 when already due,
    /// `u64::MAX` when no timer is pending. Also re-arms the front
    /// notification latch.
    pub fn get_next_timer(&self) -> u64 {
        self.tickled.store(false, Ordering::SeqCst);
        let timers = self.timers.read().unwrap();
        match timers.iter().next() {
            None => u64::MAX,
            Some(entry) => {
                let next = entry.0.next_ms.load(Ordering::Relaxed);
                next.saturating_sub(now_ms())
            }
        }
    }

    /// Detach and return the callbacks of every due timer, re-arming
    /// recurring ones.
    pub fn list_expired_callbacks(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        {
            let timers = self.timers.read().unwrap();
            match timers.iter().next() {
                None => return Vec::new(),
                Some(first) if first.0.next_ms.load(Ordering::Relaxed) > now => {
                    return Vec::new()
                }
                _ => {}
            }
        }

        let mut expired = Vec::new();
        let close_recurring = self.close_recurring.load(Ordering::SeqCst);
        let mut timers = self.timers.write().unwrap();
        loop {
            let Some(first) = timers.iter().next() else { break };
            if first.0.next_ms.load(Ordering::Relaxed) > now {
                break;
            }
            let entry = TimerEntry(first.0.clone());
            timers.remove(&entry);
            let timer = entry.0;
            let mut cb_slot = timer.cb.lock().unwrap();
            if timer.recurring && !close_recurring {
                if let Some(cb) = cb_slot.as_ref() {
                    expired.push(cb.clone());
                }
                drop(cb_slot);
                timer
                    .next_ms
                    .store(now + timer.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                timers.insert(TimerEntry(timer));
            } else if let Some(cb) = cb_slot.take() {
                expired.push(cb);
            }
        }
        if !expired.is_empty() {
            kdebug!("{} timer(s) expired", expired.len());
        }
        expired
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Stop re-arming recurring timers. Each fires at most once more;
    /// used during shutdown so the reactor can drain.
    pub fn close_recurring_timers(&self) {
        self.close_recurring.store(true, Ordering::SeqCst);
    }

    fn insert_locked(&self, timers: &mut BTreeSet<TimerEntry>, entry: TimerEntry) -> bool {
        let key = entry.key();
        timers.insert(entry);
        let is_front = timers
            .iter()
            .next()
            .map(|e| e.key() == key)
            .unwrap_or(false);
        is_front && !self.tickled.swap(true, Ordering::SeqCst)
    }

    fn notify_front(&self) {
        let hook = self.front_notify.lock().unwrap();
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone) {
        let c = Arc::new(AtomicUsize::new(0));
        let cc = c.clone();
        (c, move || {
            cc.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_due_timer_expires_once() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        mgr.add_timer(0, cb, false);
        for cb in mgr.list_expired_callbacks() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
        assert!(mgr.list_expired_callbacks().is_empty());
    }

    #[test]
    fn test_pending_timer_not_expired_early() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        mgr.add_timer(60_000, cb, false);
        assert!(mgr.list_expired_callbacks().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        let next = mgr.get_next_timer();
        assert!(next > 0 && next <= 60_000);
    }

    #[test]
    fn test_recurring_timer_rearms_until_closed() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        mgr.add_timer(0, cb, true);
        for cb in mgr.list_expired_callbacks() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer());

        mgr.close_recurring_timers();
        for cb in mgr.list_expired_callbacks() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        let timer = mgr.add_timer(0, cb, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(mgr.list_expired_callbacks().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let (_, cb) = counter();
        let timer = mgr.add_timer(50, cb, false);
        assert!(timer.refresh());
        let next = mgr.get_next_timer();
        assert!(next > 0 && next <= 50);
    }

    #[test]
    fn test_reset_from_now_changes_period() {
        let mgr = TimerManager::new();
        let (_, cb) = counter();
        let timer = mgr.add_timer(10, cb, false);
        assert!(timer.reset(60_000, true));
        assert!(mgr.list_expired_callbacks().is_empty());
        let next = mgr.get_next_timer();
        assert!(next > 10_000);
    }

    #[test]
    fn test_identical_deadlines_coexist() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        mgr.add_timer(0, cb.clone(), false);
        mgr.add_timer(0, cb, false);
        for cb in mgr.list_expired_callbacks() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_condition_timer_skips_dead_condition() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        let alive = Arc::new(AtomicBool::new(false));
        let a = alive.clone();
        mgr.add_condition_timer(0, cb, move || a.load(Ordering::SeqCst), false);
        for cb in mgr.list_expired_callbacks() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_front_notify_latches_until_poll() {
        let mgr = TimerManager::new();
        let (notifies, hook) = counter();
        mgr.set_front_notify(hook);

        let (_, cb) = counter();
        mgr.add_timer(100, cb.clone(), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);

        // Earlier deadline, but the latch is still set.
        mgr.add_timer(50, cb.clone(), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);

        // Polling re-arms the latch.
        let _ = mgr.get_next_timer();
        mgr.add_timer(10, cb, false);
        assert_eq!(notifies.load(Ordering::SeqCst), 2);
    }
}
