//! A fiber-aware mutual-exclusion lock.
//!
//! Unlike [`crate::spinlock::Spinlock`], a contended `Mutex::lock` does not
//! busy-wait: the calling fiber is parked on the mutex's wait-queue and the
//! scheduler moves on to some other ready fiber, because on a single OS
//! thread spinning for a lock held by another fiber on that same thread
//! would simply hang forever. Release marks the lock free and wakes the
//! longest-waiting fiber (if any), which re-contends in `lock()`'s loop
//! exactly like a fresh caller — this avoids starving the oldest waiter in
//! the common case without requiring a true baton hand-off, which would
//! need the woken waiter to skip the `locked` check entirely and is easy
//! to get wrong (a waiter resumed that way must assume ownership
//! unconditionally, including across a `Condvar::wait` re-lock).

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::context::{self, RunState};
use crate::spinlock::Spinlock;
use crate::wait_queue::WaitQueue;

struct Inner {
    locked: bool,
    waiters: WaitQueue,
}

/// A mutual-exclusion lock that suspends the waiting fiber instead of
/// spinning.
pub struct Mutex<T: ?Sized> {
    inner: Spinlock<Inner>,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Spinlock::new(Inner {
                locked: false,
                waiters: WaitQueue::new(),
            }),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, suspending the calling fiber for as long as it
    /// is held elsewhere.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let me = context::current();
            {
                let mut inner = self.inner.lock();
                if !inner.locked {
                    inner.locked = true;
                    return MutexGuard { mutex: self };
                }
                me.set_state(RunState::Waiting);
                inner.waiters.push(me.clone());
                log::debug!(target: "fibra::mutex", "fiber {} contended on mutex lock", me.id());
            }
            context::suspend_point();
        }
    }

    /// Acquires the lock only if it is immediately available.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut inner = self.inner.lock();
        if inner.locked {
            None
        } else {
            inner.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock(&self) {
        let mut inner = self.inner.lock();
        inner.locked = false;
        let next = inner.waiters.pop();
        drop(inner);
        // The woken waiter re-contends in `lock()`'s loop rather than
        // being handed ownership outright, so a third fiber racing in via
        // `try_lock`/`lock` between this point and the waiter actually
        // resuming may win the lock first; the waiter simply re-queues in
        // that case. This is what keeps release correct even when the
        // released fiber suspended (e.g. yielded) while still holding
        // the lock.
        if let Some(next) = next {
            next.scheduler.clone().schedule(&next);
        }
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}
