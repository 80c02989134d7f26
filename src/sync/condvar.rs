//! A fiber-aware condition variable, paired with [`crate::sync::Mutex`]
//! exactly as `std::sync::Condvar` pairs with `std::sync::Mutex`: `wait`
//! atomically releases the mutex and suspends, re-acquiring it before
//! returning. The naming and split between `wait`/`wait_timeout` follows
//! std; the atomic release-then-park step is the same one `compio-sync`'s
//! condvar documents needing, to avoid the lost-wakeup window between
//! "decide to wait" and "actually asleep".

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::{self, RunState};
use crate::spinlock::Spinlock;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::wait_queue::WaitQueue;

/// A condition variable for coordinating fibers that share a [`Mutex`].
pub struct Condvar {
    waiters: Spinlock<WaitQueue>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: Spinlock::new(WaitQueue::new()),
        }
    }

    /// Atomically unlocks `guard` and suspends the calling fiber until
    /// woken by [`notify_one`](Self::notify_one) or
    /// [`notify_all`](Self::notify_all), then re-locks the mutex before
    /// returning.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        let me = context::current();
        me.set_state(RunState::Waiting);
        self.waiters.lock().push(me.clone());
        log::debug!(target: "fibra::condvar", "fiber {} waiting on condvar", me.id());
        drop(guard);
        context::suspend_point();
        mutex.lock()
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout` if not
    /// woken first. The returned `bool` is `true` if the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        self.wait_deadline(guard, Instant::now() + timeout)
    }

    /// Like [`wait`](Self::wait), but gives up at `deadline` if not woken
    /// first. The returned `bool` is `true` if the wait timed out.
    pub fn wait_deadline<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool) {
        let mutex = guard.mutex();
        let me = context::current();
        me.set_state(RunState::Waiting);
        self.waiters.lock().push(me.clone());
        log::debug!(target: "fibra::condvar", "fiber {} waiting on condvar with deadline", me.id());
        me.scheduler.clone().register_timeout(me.clone(), deadline);
        drop(guard);
        context::suspend_point();

        let timed_out = me.take_timed_out();
        if timed_out {
            log::warn!(target: "fibra::condvar", "fiber {} timed out waiting on condvar", me.id());
            self.waiters.lock().unlink(&me);
        }
        (mutex.lock(), timed_out)
    }

    /// Wakes one waiting fiber, if any.
    pub fn notify_one(&self) {
        if let Some(ctx) = self.waiters.lock().pop() {
            log::trace!(target: "fibra::condvar", "notify_one waking fiber {}", ctx.id());
            ctx.scheduler.clone().schedule(&ctx);
        }
    }

    /// Wakes every waiting fiber.
    pub fn notify_all(&self) {
        let waiters = self.waiters.lock().drain();
        log::trace!(target: "fibra::condvar", "notify_all waking {} fiber(s)", waiters.len());
        for ctx in waiters {
            ctx.scheduler.clone().schedule(&ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, DEFAULT_STACK_SIZE};
    use crate::fiber::this_fiber;
    use crate::scheduler::Scheduler;

    #[test]
    fn notify_one_wakes_a_single_waiter() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let mutex = Arc::new(Mutex::new(false));
        let condvar = Arc::new(Condvar::new());
        let woke = Arc::new(Spinlock::new(0u32));

        for _ in 0..3 {
            let mutex = mutex.clone();
            let condvar = condvar.clone();
            let woke = woke.clone();
            let ctx = Context::spawn(shared.clone(), None, DEFAULT_STACK_SIZE, move || {
                let mut guard = mutex.lock();
                while !*guard {
                    guard = condvar.wait(guard);
                }
                *woke.lock() += 1;
            })
            .unwrap();
            scheduler.spawn_context(ctx);
        }

        let notifier_mutex = mutex.clone();
        let notifier_condvar = condvar.clone();
        let notifier = Context::spawn(shared, None, DEFAULT_STACK_SIZE, move || {
            this_fiber::yield_now();
            *notifier_mutex.lock() = true;
            notifier_condvar.notify_all();
        })
        .unwrap();
        scheduler.spawn_context(notifier);
        scheduler.run();

        assert_eq!(*woke.lock(), 3);
    }

    #[test]
    fn wait_timeout_reports_elapsed() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let mutex = Arc::new(Mutex::new(()));
        let condvar = Arc::new(Condvar::new());
        let timed_out = Arc::new(Spinlock::new(false));
        let timed_out_in_fiber = timed_out.clone();

        let ctx = Context::spawn(shared, None, DEFAULT_STACK_SIZE, move || {
            let guard = mutex.lock();
            let (_guard, did_time_out) = condvar.wait_timeout(guard, Duration::from_millis(10));
            *timed_out_in_fiber.lock() = did_time_out;
        })
        .unwrap();
        scheduler.spawn_context(ctx);
        scheduler.run();

        assert!(*timed_out.lock());
    }
}
