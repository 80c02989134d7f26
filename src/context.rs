//! The fiber control block.
//!
//! A [`Context`] pairs a stackful coroutine (the saved execution state,
//! delegated entirely to the `corosensei` crate — see §9 of `SPEC_FULL.md`
//! for why this core does not hand-roll register/stack switching) with the
//! bookkeeping the scheduler and the synchronization primitives need: a
//! run-state, an intrusive wait-queue link, and a small set of join
//! bookkeeping fields.
//!
//! Suspending from arbitrary call depth (not just the fiber's top-level
//! function) is the whole point of a *stackful* coroutine. `corosensei`
//! hands a `&Yielder` to the coroutine body once; this module caches a
//! pointer to it on the `Context` and republishes it to a thread-local on
//! every resume, so that code anywhere in the fiber's call stack — a
//! channel deep inside three layers of application code — can call
//! [`suspend_point`] without threading a `Yielder` reference through every
//! signature. This is the same trick `bran`'s `PARENT_CONTEXT` thread-local
//! uses for its scheduler/coroutine handoff.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::scheduler::SchedulerShared;
use crate::spinlock::Spinlock;
use crate::wait_queue::WaitQueue;

/// Default stack size for a fiber that doesn't ask for a specific one.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Ready,
    Running,
    Waiting,
    Terminated,
}

impl RunState {
    const fn to_u8(self) -> u8 {
        match self {
            RunState::Ready => 0,
            RunState::Running => 1,
            RunState::Waiting => 2,
            RunState::Terminated => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => RunState::Ready,
            1 => RunState::Running,
            2 => RunState::Waiting,
            _ => RunState::Terminated,
        }
    }
}

type Body = Coroutine<(), (), ()>;

/// The fiber control block.
///
/// Always held behind an `Arc`: the scheduler's ready queue, a
/// synchronization primitive's wait-queue, and any outstanding
/// [`crate::fiber::JoinHandle`] may each hold a clone simultaneously, and
/// the `Context` is only dropped once every one of them has let go.
pub struct Context {
    id: u64,
    name: Option<Box<str>>,
    state: AtomicU8,
    timed_out: AtomicBool,
    finished: AtomicBool,

    pub(crate) scheduler: Arc<SchedulerShared>,

    // SAFETY: `next` is the intrusive wait-queue link. It is read/written
    // only by code that holds the lock guarding whichever `WaitQueue`
    // currently owns this context (or, for a context not presently in any
    // queue, not read/written at all). Exactly one queue may own a given
    // context at a time, matching the invariant documented on `WaitQueue`.
    next: UnsafeCell<Option<Arc<Context>>>,

    // SAFETY: `body` (the coroutine) and `yielder` are touched only by the
    // owning Scheduler's thread: the scheduler never resumes two contexts
    // concurrently, and no other thread calls `resume` or reads `yielder`.
    // Cross-thread wakeups only ever touch the atomics above and the
    // `join_waiters`/`panic_payload` spinlocks below.
    body: UnsafeCell<Option<Body>>,
    yielder: Cell<Option<NonNull<Yielder<(), ()>>>>,

    join_waiters: Spinlock<WaitQueue>,
    panic_payload: Spinlock<Option<Box<dyn std::any::Any + Send + 'static>>>,
}

// SAFETY: see the field-level safety comments above; every field that is
// not itself `Send`/`Sync` (the cached `Yielder` pointer, the coroutine
// body) is only ever touched by the single thread that owns this
// context's scheduler, enforced by construction (contexts are never
// resumed outside their owning scheduler's run loop).
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

fn next_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Context>>> = const { RefCell::new(None) };
    static CURRENT_YIELDER: Cell<*const Yielder<(), ()>> = const { Cell::new(std::ptr::null()) };
}

impl Context {
    /// Builds a fresh, unscheduled context wrapping `f`. The caller (the
    /// scheduler) is responsible for pushing it onto the ready queue.
    pub(crate) fn spawn<F>(
        scheduler: Arc<SchedulerShared>,
        name: Option<String>,
        stack_size: usize,
        f: F,
    ) -> std::io::Result<Arc<Context>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(stack_size).map_err(|e| {
            std::io::Error::other(format!("failed to allocate a {stack_size}-byte fiber stack: {e}"))
        })?;

        let ctx = Arc::new(Context {
            id: next_id(),
            name: name.map(String::into_boxed_str),
            state: AtomicU8::new(RunState::Ready.to_u8()),
            timed_out: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            scheduler,
            next: UnsafeCell::new(None),
            body: UnsafeCell::new(None),
            yielder: Cell::new(None),
            join_waiters: Spinlock::new(WaitQueue::new()),
            panic_payload: Spinlock::new(None),
        });

        let body_ctx = ctx.clone();
        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, ()| {
            body_ctx.yielder.set(Some(NonNull::from(yielder)));
            let result = std::panic::catch_unwind(AssertUnwindSafe(f));
            body_ctx.on_finished(result);
        });

        // SAFETY: `ctx` has not been published anywhere yet (not on a
        // ready queue, not returned to a caller), so this is the only
        // reference and the write below cannot race.
        unsafe {
            *ctx.body.get() = Some(coroutine);
        }

        Ok(ctx)
    }

    #[cfg(test)]
    pub(crate) fn spawn_test(scheduler: Arc<SchedulerShared>) -> Arc<Context> {
        Self::spawn(scheduler, None, DEFAULT_STACK_SIZE, || {})
            .expect("test stack allocation should not fail")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Attempts to transition `Waiting -> Ready`. Used by both an explicit
    /// wakeup (`Scheduler::schedule`) and the sleep-set timeout sweep as a
    /// single decision point: whichever caller wins the compare-exchange is
    /// the one that actually enqueues the context, so a context can never
    /// be enqueued twice for the same suspension.
    pub(crate) fn try_mark_ready(&self) -> bool {
        self.state
            .compare_exchange(
                RunState::Waiting.to_u8(),
                RunState::Ready.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_timed_out(&self, value: bool) {
        self.timed_out.store(value, Ordering::Relaxed);
    }

    /// Reads and clears the timeout flag. `true` means the most recent
    /// suspension ended because a deadline elapsed rather than an explicit
    /// wakeup.
    pub(crate) fn take_timed_out(&self) -> bool {
        self.timed_out.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn join_waiters(&self) -> &Spinlock<WaitQueue> {
        &self.join_waiters
    }

    fn on_finished(&self, result: std::thread::Result<()>) {
        if let Err(payload) = result {
            log::warn!(target: "fibra::context", "fiber {} panicked", self.id);
            *self.panic_payload.lock() = Some(payload);
        }
        self.finished.store(true, Ordering::Release);
        self.set_state(RunState::Terminated);

        let waiters = self.join_waiters.lock().drain();
        for waiter in waiters {
            self.scheduler.schedule(&waiter);
        }
    }

    /// Takes the panic payload recorded by a fiber that panicked, if any.
    /// Consumed by `JoinHandle::join`.
    pub(crate) fn take_panic(&self) -> Option<Box<dyn std::any::Any + Send + 'static>> {
        self.panic_payload.lock().take()
    }

    /// Resumes this context's coroutine. Must only be called by the
    /// context's owning scheduler, on its own thread, and never while this
    /// context is already the one running.
    ///
    /// Returns `true` if the coroutine yielded (is still alive and will
    /// need resuming again later), `false` if it ran to completion.
    pub(crate) fn resume(self: &Arc<Self>) -> bool {
        if let Some(yielder) = self.yielder.get() {
            CURRENT_YIELDER.with(|cell| cell.set(yielder.as_ptr()));
        }

        // SAFETY: the owning scheduler thread is the only caller, and it
        // never calls `resume` reentrantly on the same context.
        let body = unsafe { &mut *self.body.get() };
        let coroutine = body
            .as_mut()
            .expect("resume called on a terminated fiber context");

        match coroutine.resume(()) {
            CoroutineResult::Yield(()) => true,
            CoroutineResult::Return(()) => {
                *body = None;
                false
            }
        }
    }

    pub(crate) fn next_is_none(&self) -> bool {
        // SAFETY: see the `next` field's safety comment; callers of
        // `WaitQueue` always hold the relevant lock.
        unsafe { (*self.next.get()).is_none() }
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Context>>) {
        unsafe {
            *self.next.get() = next;
        }
    }

    pub(crate) fn take_next(&self) -> Option<Arc<Context>> {
        unsafe { (*self.next.get()).take() }
    }

    pub(crate) fn clone_next(&self) -> Option<Arc<Context>> {
        unsafe { (*self.next.get()).clone() }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Suspends the calling fiber, returning control to whichever frame most
/// recently resumed it. Panics if called outside of a running fiber.
pub(crate) fn suspend_point() {
    CURRENT_YIELDER.with(|cell| {
        let ptr = cell.get();
        assert!(
            !ptr.is_null(),
            "suspend_point called outside of a running fiber"
        );
        // SAFETY: valid for the lifetime of the owning coroutine's stack,
        // which is alive for as long as this call can execute.
        unsafe { (*ptr).suspend(()) };
    });
}

/// Returns the context of the fiber currently running on this thread, if
/// any.
pub fn try_current() -> Option<Arc<Context>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Returns the context of the fiber currently running on this thread.
///
/// # Panics
/// Panics if called from outside a fiber (e.g. directly from the thread
/// that is merely driving a `Scheduler`'s run loop).
pub fn current() -> Arc<Context> {
    try_current().expect("not running inside a fiber")
}

/// Installs `ctx` as the current fiber for the duration of `scope`,
/// restoring the previous value (if any) afterwards. Called by the
/// scheduler's run loop around each `resume`.
pub(crate) fn with_current<R>(ctx: &Arc<Context>, scope: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|cell| cell.borrow_mut().replace(ctx.clone()));
    let result = scope();
    CURRENT.with(|cell| *cell.borrow_mut() = previous);
    result
}
