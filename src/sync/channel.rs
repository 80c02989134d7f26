//! An unbuffered (capacity-0) rendezvous channel.
//!
//! A `send` only completes once some `recv` is there to take the value —
//! there is no internal buffer a sender can drop a value into and walk
//! away from, matching the distilled design's "rendezvous" framing. Both
//! sides register themselves (with a small payload cell for the side that
//! doesn't yet have a partner) in a plain `VecDeque` rather than the
//! intrusive `WaitQueue` used by [`crate::sync::Mutex`] and
//! [`crate::sync::Condvar`]: those two never need to carry a payload
//! alongside the waiting context, this one always does.
//!
//! Naming (`Sender`/`Receiver`, `RecvError`, `SendError`) mirrors
//! `std::sync::mpsc` and `crossbeam_channel`, which this crate's benchmarks
//! compare against directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::{self, RunState};
use crate::error::{RecvError, RecvTimeoutError, SendError, SendTimeoutError};
use crate::spinlock::Spinlock;

struct Pending<T> {
    ctx: Arc<context::Context>,
    payload: Arc<Spinlock<Option<T>>>,
}

struct ChannelState<T> {
    closed: bool,
    senders: VecDeque<Pending<T>>,
    receivers: VecDeque<Pending<T>>,
}

struct Channel<T> {
    state: Spinlock<ChannelState<T>>,
}

/// The sending half of an unbuffered channel. Cloneable: many fibers may
/// hold a `Sender` for the same channel.
pub struct Sender<T> {
    channel: Arc<Channel<T>>,
}

/// The receiving half of an unbuffered channel. Cloneable: many fibers may
/// hold a `Receiver` for the same channel, competing for each value.
pub struct Receiver<T> {
    channel: Arc<Channel<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

/// Creates a new unbuffered channel.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let channel = Arc::new(Channel {
        state: Spinlock::new(ChannelState {
            closed: false,
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
        }),
    });
    log::debug!(target: "fibra::channel", "channel opened");
    (
        Sender {
            channel: channel.clone(),
        },
        Receiver { channel },
    )
}

enum SendOutcome<T> {
    Delivered,
    Disconnected(T),
    TimedOut(T),
}

enum RecvOutcome<T> {
    Delivered(T),
    Disconnected,
    TimedOut,
}

impl<T> Sender<T> {
    /// Blocks the calling fiber until a receiver takes `value`, or the
    /// channel is closed.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        match self.send_impl(value, None) {
            SendOutcome::Delivered => Ok(()),
            SendOutcome::Disconnected(v) => Err(SendError(v)),
            SendOutcome::TimedOut(_) => unreachable!("send with no deadline cannot time out"),
        }
    }

    /// Like [`send`](Self::send), but gives up after `timeout` if no
    /// receiver has appeared.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.send_deadline(value, Instant::now() + timeout)
    }

    /// Like [`send`](Self::send), but gives up at `deadline` if no receiver
    /// has appeared.
    pub fn send_deadline(&self, value: T, deadline: Instant) -> Result<(), SendTimeoutError<T>> {
        match self.send_impl(value, Some(deadline)) {
            SendOutcome::Delivered => Ok(()),
            SendOutcome::Disconnected(v) => Err(SendTimeoutError::Disconnected(v)),
            SendOutcome::TimedOut(v) => Err(SendTimeoutError::Timeout(v)),
        }
    }

    /// Closes the channel. Every fiber presently blocked in `send` or
    /// `recv` is woken and told the channel is closed; future calls fail
    /// immediately.
    pub fn close(&self) {
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.state.lock().closed
    }

    fn send_impl(&self, value: T, deadline: Option<Instant>) -> SendOutcome<T> {
        let mut state = self.channel.state.lock();
        if state.closed {
            log::trace!(target: "fibra::channel", "send on a closed channel");
            return SendOutcome::Disconnected(value);
        }
        if let Some(receiver) = state.receivers.pop_front() {
            drop(state);
            *receiver.payload.lock() = Some(value);
            log::trace!(target: "fibra::channel", "rendezvous: handed value directly to waiting receiver fiber {}", receiver.ctx.id());
            receiver.ctx.scheduler.clone().schedule(&receiver.ctx);
            return SendOutcome::Delivered;
        }

        let me = context::current();
        let payload = Arc::new(Spinlock::new(Some(value)));
        me.set_state(RunState::Waiting);
        state.senders.push_back(Pending {
            ctx: me.clone(),
            payload: payload.clone(),
        });
        log::debug!(target: "fibra::channel", "fiber {} blocked on send, no receiver waiting", me.id());
        if let Some(deadline) = deadline {
            me.scheduler.clone().register_timeout(me.clone(), deadline);
        }
        drop(state);
        context::suspend_point();

        match payload.lock().take() {
            None => SendOutcome::Delivered,
            Some(value) => {
                self.channel
                    .state
                    .lock()
                    .senders
                    .retain(|p| !Arc::ptr_eq(&p.ctx, &me));
                if me.take_timed_out() {
                    log::warn!(target: "fibra::channel", "fiber {} timed out waiting to send", me.id());
                    SendOutcome::TimedOut(value)
                } else {
                    SendOutcome::Disconnected(value)
                }
            }
        }
    }
}

impl<T> Receiver<T> {
    /// Blocks the calling fiber until a sender offers a value, or the
    /// channel is closed and no sender is waiting.
    ///
    /// # Panics
    /// Panics if called outside of a fiber.
    pub fn recv(&self) -> Result<T, RecvError> {
        match self.recv_impl(None) {
            RecvOutcome::Delivered(v) => Ok(v),
            RecvOutcome::Disconnected => Err(RecvError),
            RecvOutcome::TimedOut => unreachable!("recv with no deadline cannot time out"),
        }
    }

    /// Like [`recv`](Self::recv), but gives up after `timeout` if no sender
    /// has appeared.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_deadline(Instant::now() + timeout)
    }

    /// Like [`recv`](Self::recv), but gives up at `deadline` if no sender
    /// has appeared.
    pub fn recv_deadline(&self, deadline: Instant) -> Result<T, RecvTimeoutError> {
        match self.recv_impl(Some(deadline)) {
            RecvOutcome::Delivered(v) => Ok(v),
            RecvOutcome::Disconnected => Err(RecvTimeoutError::Disconnected),
            RecvOutcome::TimedOut => Err(RecvTimeoutError::Timeout),
        }
    }

    pub fn close(&self) {
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.state.lock().closed
    }

    fn recv_impl(&self, deadline: Option<Instant>) -> RecvOutcome<T> {
        loop {
            let mut state = self.channel.state.lock();
            if let Some(sender) = state.senders.pop_front() {
                drop(state);
                // A sender that has just timed out takes its own payload
                // back (see `send_impl`'s timeout path) before removing
                // itself from `senders`; across schedulers those two steps
                // can race this `pop_front`, so finding the payload already
                // gone just means this sender is stale. Retry against
                // whoever is now at the front instead of asserting.
                let Some(value) = sender.payload.lock().take() else {
                    log::trace!(
                        target: "fibra::channel",
                        "recv raced a timing-out sender {}, retrying",
                        sender.ctx.id()
                    );
                    continue;
                };
                log::trace!(target: "fibra::channel", "rendezvous: took value from sender fiber {}", sender.ctx.id());
                sender.ctx.scheduler.clone().schedule(&sender.ctx);
                return RecvOutcome::Delivered(value);
            }
            if state.closed {
                log::trace!(target: "fibra::channel", "recv on a closed, drained channel");
                return RecvOutcome::Disconnected;
            }

            let me = context::current();
            let payload: Arc<Spinlock<Option<T>>> = Arc::new(Spinlock::new(None));
            me.set_state(RunState::Waiting);
            state.receivers.push_back(Pending {
                ctx: me.clone(),
                payload: payload.clone(),
            });
            log::debug!(target: "fibra::channel", "fiber {} blocked on recv, no sender waiting", me.id());
            if let Some(deadline) = deadline {
                me.scheduler.clone().register_timeout(me.clone(), deadline);
            }
            drop(state);
            context::suspend_point();

            return match payload.lock().take() {
                Some(value) => RecvOutcome::Delivered(value),
                None => {
                    self.channel
                        .state
                        .lock()
                        .receivers
                        .retain(|p| !Arc::ptr_eq(&p.ctx, &me));
                    if me.take_timed_out() {
                        log::warn!(target: "fibra::channel", "fiber {} timed out waiting to recv", me.id());
                        RecvOutcome::TimedOut
                    } else {
                        RecvOutcome::Disconnected
                    }
                }
            };
        }
    }
}

impl<T> Channel<T> {
    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let senders = std::mem::take(&mut state.senders);
        let receivers = std::mem::take(&mut state.receivers);
        drop(state);
        log::debug!(
            target: "fibra::channel",
            "channel closed, waking {} sender(s) and {} receiver(s)",
            senders.len(),
            receivers.len()
        );
        for pending in senders {
            pending.ctx.scheduler.clone().schedule(&pending.ctx);
        }
        for pending in receivers {
            pending.ctx.scheduler.clone().schedule(&pending.ctx);
        }
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::this_fiber;
    use crate::scheduler::Scheduler;

    #[test]
    fn rendezvous_hands_off_value() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let (tx, rx) = channel::<i32>();
        let received = Arc::new(Spinlock::new(None));
        let received_in_fiber = received.clone();

        let producer = crate::context::Context::spawn(
            shared.clone(),
            None,
            crate::context::DEFAULT_STACK_SIZE,
            move || {
                tx.send(7).unwrap();
            },
        )
        .unwrap();
        let consumer = crate::context::Context::spawn(
            shared.clone(),
            None,
            crate::context::DEFAULT_STACK_SIZE,
            move || {
                *received_in_fiber.lock() = rx.recv().ok();
            },
        )
        .unwrap();
        scheduler.spawn_context(producer);
        scheduler.spawn_context(consumer);
        scheduler.run();

        assert_eq!(*received.lock(), Some(7));
    }

    #[test]
    fn recv_after_close_with_no_sender_errs() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let (tx, rx) = channel::<i32>();
        let outcome = Arc::new(Spinlock::new(None));
        let outcome_in_fiber = outcome.clone();

        tx.close();
        let consumer = crate::context::Context::spawn(
            shared,
            None,
            crate::context::DEFAULT_STACK_SIZE,
            move || {
                *outcome_in_fiber.lock() = Some(rx.recv());
            },
        )
        .unwrap();
        scheduler.spawn_context(consumer);
        scheduler.run();

        assert_eq!(*outcome.lock(), Some(Err(RecvError)));
    }

    #[test]
    fn recv_timeout_elapses_without_sender() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let (_tx, rx) = channel::<i32>();
        let outcome = Arc::new(Spinlock::new(None));
        let outcome_in_fiber = outcome.clone();

        let consumer = crate::context::Context::spawn(
            shared,
            None,
            crate::context::DEFAULT_STACK_SIZE,
            move || {
                *outcome_in_fiber.lock() = Some(rx.recv_timeout(Duration::from_millis(10)));
            },
        )
        .unwrap();
        scheduler.spawn_context(consumer);
        scheduler.run();

        assert_eq!(*outcome.lock(), Some(Err(RecvTimeoutError::Timeout)));
    }

    #[test]
    fn waiting_sender_is_woken_by_close() {
        let scheduler = Scheduler::new();
        let shared = scheduler.shared().clone();
        let (tx, _rx) = channel::<i32>();
        let tx_for_closer = tx.clone();
        let outcome = Arc::new(Spinlock::new(None));
        let outcome_in_fiber = outcome.clone();

        let sender_fiber = crate::context::Context::spawn(
            shared.clone(),
            None,
            crate::context::DEFAULT_STACK_SIZE,
            move || {
                *outcome_in_fiber.lock() = Some(tx.send(1).is_err());
            },
        )
        .unwrap();
        let closer = crate::context::Context::spawn(
            shared,
            None,
            crate::context::DEFAULT_STACK_SIZE,
            move || {
                this_fiber::yield_now();
                tx_for_closer.close();
            },
        )
        .unwrap();
        scheduler.spawn_context(sender_fiber);
        scheduler.spawn_context(closer);
        scheduler.run();

        assert_eq!(*outcome.lock(), Some(true));
    }
}
