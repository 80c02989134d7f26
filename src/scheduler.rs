//! The single-threaded cooperative run loop.
//!
//! A [`Scheduler`] owns one ready queue and one deadline-ordered sleep set,
//! and is driven to completion by whichever OS thread calls [`Scheduler::run`].
//! There is no separate "dispatcher" fiber or `Context` object for the
//! driving thread itself — the run loop's own stack frame *is* the
//! dispatcher, the same simplification `tarantool-module`'s cooperative
//! scheduler documentation describes: the thread that calls into the event
//! loop is never itself represented as a schedulable entity.
//!
//! Waking a fiber from another OS thread (a `Broadcast::notify` called off
//! the scheduler's own thread, for instance) only ever touches the atomics
//! on `Context` and this module's spinlock-guarded queues, then unparks the
//! driving thread via `std::thread::Thread::unpark`. `park`/`unpark`'s
//! single-token semantics are what make this race-free without a condvar of
//! our own: an unpark that arrives before the corresponding park is not
//! lost, it is simply consumed by the next park call.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Instant;

use crate::context::{self, Context, RunState};
use crate::spinlock::Spinlock;

struct SleepEntry {
    deadline: Instant,
    ctx: Arc<Context>,
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for SleepEntry {}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for SleepEntry {
    // Reversed so that `BinaryHeap` (a max-heap) yields the *earliest*
    // deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

/// The state a [`Scheduler`] shares with every `Context` it owns and with
/// anything that needs to wake one of its fibers from another thread.
pub(crate) struct SchedulerShared {
    ready: Spinlock<VecDeque<Arc<Context>>>,
    sleeping: Spinlock<BinaryHeap<SleepEntry>>,
    driver: Spinlock<Thread>,
    alive: AtomicUsize,
}

impl SchedulerShared {
    fn new() -> Arc<Self> {
        Self::with_capacity_hint(0)
    }

    fn with_capacity_hint(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            ready: Spinlock::new(VecDeque::with_capacity(capacity)),
            sleeping: Spinlock::new(BinaryHeap::new()),
            driver: Spinlock::new(thread::current()),
            alive: AtomicUsize::new(0),
        })
    }

    /// A `SchedulerShared` good only for constructing standalone `Context`s
    /// in tests that never actually call `resume`.
    #[cfg(test)]
    pub(crate) fn new_standalone() -> Arc<Self> {
        Self::new()
    }

    pub(crate) fn enqueue_ready(&self, ctx: Arc<Context>) {
        log::debug!(target: "fibra::scheduler", "spawned fiber {}", ctx.id());
        self.alive.fetch_add(1, Ordering::Relaxed);
        self.ready.lock().push_back(ctx);
        self.driver.lock().unpark();
    }

    /// Wakes `ctx` if it is presently `Waiting`. A no-op if it has already
    /// been woken by another path (the timeout sweep, say), which is how
    /// a fiber is guaranteed to be enqueued at most once per suspension.
    pub(crate) fn schedule(&self, ctx: &Arc<Context>) {
        if ctx.try_mark_ready() {
            log::trace!(target: "fibra::scheduler", "schedule fiber {}", ctx.id());
            self.ready.lock().push_back(ctx.clone());
            self.driver.lock().unpark();
        }
    }

    pub(crate) fn register_timeout(&self, ctx: Arc<Context>, deadline: Instant) {
        self.sleeping.lock().push(SleepEntry { deadline, ctx });
    }

    fn mark_terminated(&self) {
        self.alive.fetch_sub(1, Ordering::Relaxed);
    }

    /// Moves every sleeper whose deadline has elapsed onto the ready queue,
    /// marking it timed-out. Returns the next pending deadline, if any, so
    /// the run loop knows how long it may safely park.
    fn wake_expired(&self, now: Instant) -> Option<Instant> {
        let mut sleeping = self.sleeping.lock();
        while let Some(entry) = sleeping.peek() {
            if entry.deadline > now {
                return Some(entry.deadline);
            }
            let entry = sleeping.pop().expect("peeked entry must be present");
            if entry.ctx.try_mark_ready() {
                log::warn!(target: "fibra::scheduler", "deadline elapsed for fiber {}", entry.ctx.id());
                entry.ctx.set_timed_out(true);
                drop(sleeping);
                self.ready.lock().push_back(entry.ctx);
                sleeping = self.sleeping.lock();
            }
        }
        None
    }
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Arc<SchedulerShared>>> =
        const { std::cell::RefCell::new(None) };
}

/// Returns the scheduler driving the calling thread's run loop.
///
/// # Panics
/// Panics outside of a `Scheduler::run` call, or from inside a fiber body
/// invoked through another scheduler's `run` (a fiber never outlives its
/// owning thread, so this should not occur in practice).
pub(crate) fn current_shared() -> Arc<SchedulerShared> {
    CURRENT_SCHEDULER
        .with(|cell| cell.borrow().clone())
        .expect("no fiber scheduler is running on this thread")
}

/// A cooperative, single-threaded fiber runtime.
///
/// Exactly one `Scheduler` drives any given OS thread at a time; fibers
/// spawned while it is running never migrate to another thread.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shared: SchedulerShared::new(),
        }
    }

    /// Builds a scheduler whose ready queue pre-allocates room for
    /// `capacity` fibers, avoiding reallocation for workloads whose
    /// fan-out is known ahead of time.
    pub fn with_capacity_hint(capacity: usize) -> Self {
        Self {
            shared: SchedulerShared::with_capacity_hint(capacity),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }

    /// Spawns a fiber onto this scheduler's ready queue. Safe to call
    /// before `run` (the fiber simply waits there) or from within a fiber
    /// already running under this scheduler.
    pub(crate) fn spawn_context(&self, ctx: Arc<Context>) {
        self.shared.enqueue_ready(ctx);
    }

    /// Drives every fiber on this scheduler to completion, returning once
    /// none remain runnable or sleeping.
    ///
    /// Must be called from the thread that should host this scheduler; it
    /// installs itself as that thread's current scheduler for the
    /// duration of the call.
    pub fn run(&self) {
        *self.shared.driver.lock() = thread::current();
        let previous = CURRENT_SCHEDULER.with(|cell| cell.borrow_mut().replace(self.shared.clone()));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_inner()));
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = previous);
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    fn run_inner(&self) {
        loop {
            let next_deadline = self.shared.wake_expired(Instant::now());

            let Some(ctx) = self.shared.ready.lock().pop_front() else {
                if self.shared.alive.load(Ordering::Relaxed) == 0 {
                    return;
                }
                match next_deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if deadline > now {
                            thread::park_timeout(deadline - now);
                        }
                    }
                    None => thread::park(),
                }
                continue;
            };

            ctx.set_state(RunState::Running);
            log::trace!(target: "fibra::scheduler", "resume fiber {}", ctx.id());
            let still_running = context::with_current(&ctx, || ctx.resume());
            log::trace!(target: "fibra::scheduler", "suspend fiber {}", ctx.id());

            if !still_running {
                log::debug!(target: "fibra::scheduler", "fiber {} terminated", ctx.id());
                self.shared.mark_terminated();
                continue;
            }

            // A fiber that suspended without anyone else changing its
            // state (a plain cooperative yield) goes straight back onto
            // the ready queue. One that was parked onto a wait-queue or
            // the sleep set already had its state changed to `Waiting`
            // before suspending, so it is left alone here — whatever
            // woke it is responsible for re-enqueuing it.
            if ctx.state() == RunState::Running {
                ctx.set_state(RunState::Ready);
                self.shared.ready.lock().push_back(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn runs_simple_fibers_to_completion() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            let ctx = Context::spawn(scheduler.shared().clone(), None, 64 * 1024, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
            scheduler.spawn_context(ctx);
        }
        scheduler.run();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn yielding_fiber_interleaves() {
        let scheduler = Scheduler::new();
        let trace = Arc::new(Spinlock::new(Vec::new()));

        for id in 0..3 {
            let trace = trace.clone();
            let ctx = Context::spawn(scheduler.shared().clone(), None, 64 * 1024, move || {
                trace.lock().push((id, 0));
                context::suspend_point();
                trace.lock().push((id, 1));
            })
            .unwrap();
            scheduler.spawn_context(ctx);
        }
        scheduler.run();

        let trace = trace.lock();
        let first_round: Vec<_> = trace.iter().take(3).map(|(_, r)| *r).collect();
        assert_eq!(first_round, vec![0, 0, 0]);
    }
}
