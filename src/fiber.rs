//! Spawning and joining fibers, and the `this_fiber` operations a fiber
//! uses to act on itself — `yield_now`, `sleep_for`/`sleep_until`, and
//! introspection. The naming mirrors `std::thread` and `std::thread::Builder`
//! deliberately: a fiber is a thread-shaped unit of cooperative work, and
//! `tarantool-module`'s `fiber` module makes the same choice for the same
//! reason — callers already know the shape of this API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::{self, Context, DEFAULT_STACK_SIZE, RunState};
use crate::scheduler::{self, Scheduler, SchedulerShared};
use crate::spinlock::Spinlock;

/// The outcome of a fiber that panicked, as delivered to `JoinHandle::join`.
pub type PanicPayload = Box<dyn std::any::Any + Send + 'static>;

/// A handle to a spawned fiber, allowing another fiber to wait for it to
/// finish and retrieve its result.
///
/// Dropping a `JoinHandle` without calling [`join`](JoinHandle::join)
/// detaches the fiber: it keeps running to completion on its own, and its
/// result (if any) is simply discarded.
pub struct JoinHandle<T> {
    ctx: Arc<Context>,
    result: Arc<Spinlock<Option<T>>>,
}

impl<T> JoinHandle<T> {
    /// Returns `true` once the fiber has run to completion (including by
    /// panicking).
    pub fn is_finished(&self) -> bool {
        self.ctx.is_finished()
    }

    /// Blocks the calling fiber until the spawned one finishes, returning
    /// its result, or the panic payload if it panicked.
    ///
    /// # Panics
    /// Panics if called from outside a fiber — there must be a suspended
    /// caller for the scheduler to resume once the join completes.
    pub fn join(self) -> Result<T, PanicPayload> {
        let me = context::current();
        {
            let mut waiters = self.ctx.join_waiters().lock();
            if !self.ctx.is_finished() {
                me.set_state(RunState::Waiting);
                waiters.push(me.clone());
                drop(waiters);
                context::suspend_point();
            }
        }

        match self.ctx.take_panic() {
            Some(payload) => Err(payload),
            None => Ok(self
                .result
                .lock()
                .take()
                .expect("finished fiber produced no result")),
        }
    }

    /// Detaches the fiber: it is left to run to completion independently
    /// and its result is discarded. Equivalent to simply dropping the
    /// handle.
    pub fn detach(self) {}
}

/// Configures and spawns a fiber, mirroring [`std::thread::Builder`].
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber, surfaced through [`this_fiber::name`] and in log
    /// output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the stack size in bytes. Defaults to
    /// [`crate::context::DEFAULT_STACK_SIZE`].
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawns the fiber onto the scheduler currently running on this
    /// thread.
    ///
    /// # Errors
    /// Returns an error if the requested stack could not be allocated.
    ///
    /// # Panics
    /// Panics if no [`crate::Scheduler`] is running on this thread.
    pub fn spawn<F, T>(self, f: F) -> std::io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let shared = scheduler::current_shared();
        spawn_on(&shared, self.name, self.stack_size.unwrap_or(DEFAULT_STACK_SIZE), f)
    }
}

fn spawn_on<F, T>(
    shared: &Arc<SchedulerShared>,
    name: Option<String>,
    stack_size: usize,
    f: F,
) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let result = Arc::new(Spinlock::new(None));
    let result_for_body = result.clone();

    let ctx = Context::spawn(shared.clone(), name, stack_size, move || {
        let value = f();
        *result_for_body.lock() = Some(value);
    })?;

    shared.enqueue_ready(ctx.clone());
    Ok(JoinHandle { ctx, result })
}

/// Spawns a fiber onto the scheduler currently running on this thread,
/// using default naming and stack size.
///
/// # Panics
/// Panics if no [`crate::Scheduler`] is running on this thread, or if the
/// default stack could not be allocated.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn fiber")
}

impl Scheduler {
    /// Seeds this scheduler with its first fiber, before it is running.
    ///
    /// This is the entry point: [`fiber::spawn`](spawn) only works from
    /// inside an already-running fiber, so at least one fiber must be
    /// placed directly onto a fresh scheduler this way before calling
    /// [`Scheduler::run`].
    ///
    /// # Errors
    /// Returns an error if the default stack could not be allocated.
    pub fn spawn<F, T>(&self, f: F) -> std::io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        spawn_on(self.shared(), None, DEFAULT_STACK_SIZE, f)
    }
}

/// Operations a fiber performs on itself.
pub mod this_fiber {
    use super::*;

    /// Returns the numeric id of the running fiber.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn id() -> u64 {
        context::current().id()
    }

    /// Returns the name given to the running fiber, if any.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn name() -> Option<String> {
        context::current().name().map(str::to_owned)
    }

    /// Cooperatively yields control back to the scheduler, allowing other
    /// ready fibers to run before this one resumes. Does not block on
    /// anything: the caller is placed at the back of the ready queue.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn yield_now() {
        let _ = context::current();
        context::suspend_point();
    }

    /// Suspends the running fiber for at least `duration`.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn sleep_for(duration: Duration) {
        sleep_until(Instant::now() + duration);
    }

    /// Suspends the running fiber until at least `deadline`.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn sleep_until(deadline: Instant) {
        let me = context::current();
        me.set_state(RunState::Waiting);
        me.scheduler.clone().register_timeout(me.clone(), deadline);
        context::suspend_point();
        me.take_timed_out();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn join_waits_for_result() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let observed = Arc::new(Spinlock::new(None));
        let observed_in_driver = observed.clone();

        let driver = Context::spawn(shared.clone(), None, DEFAULT_STACK_SIZE, move || {
            let inner = spawn(|| 40 + 2);
            let value = inner.join().expect("fiber should not panic");
            *observed_in_driver.lock() = Some(value);
        })
        .unwrap();
        scheduler.spawn_context(driver);
        scheduler.run();

        assert_eq!(*observed.lock(), Some(42));
    }

    #[test]
    fn join_propagates_panic() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let panicked = Arc::new(Spinlock::new(false));
        let panicked_in_driver = panicked.clone();

        let driver = Context::spawn(shared.clone(), None, DEFAULT_STACK_SIZE, move || {
            let inner = spawn(|| -> i32 { panic!("boom") });
            *panicked_in_driver.lock() = inner.join().is_err();
        })
        .unwrap();
        scheduler.spawn_context(driver);
        scheduler.run();

        assert!(*panicked.lock());
    }

    #[test]
    fn yield_now_lets_others_run() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Spinlock::new(Vec::new()));

        for id in 0..2 {
            let order = order.clone();
            let shared = scheduler.shared().clone();
            let ctx = Context::spawn(shared, None, DEFAULT_STACK_SIZE, move || {
                order.lock().push((id, "start"));
                this_fiber::yield_now();
                order.lock().push((id, "end"));
            })
            .unwrap();
            scheduler.spawn_context(ctx);
        }
        scheduler.run();

        let order = order.lock();
        assert_eq!(order[0], (0, "start"));
        assert_eq!(order[1], (1, "start"));
    }

    #[test]
    fn sleep_for_delays_resumption() {
        let scheduler = Scheduler::new();
        let woke = Arc::new(AtomicUsize::new(0));
        let woke2 = woke.clone();
        let shared = scheduler.shared().clone();

        let ctx = Context::spawn(shared, None, DEFAULT_STACK_SIZE, move || {
            this_fiber::sleep_for(Duration::from_millis(20));
            woke2.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        scheduler.spawn_context(ctx);

        let start = Instant::now();
        scheduler.run();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(woke.load(Ordering::Relaxed), 1);
    }
}
