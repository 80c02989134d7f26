//! Fiber-aware synchronization primitives: a [`Mutex`]/[`Condvar`] pair
//! that suspend rather than spin, an unbuffered rendezvous [`channel`],
//! and a type-keyed [`Broadcast`] sink.

mod broadcast;
mod channel;
mod condvar;
mod mutex;

pub use broadcast::{Broadcast, Subscription};
pub use channel::{channel, Receiver, Sender};
pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
