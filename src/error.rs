//! The status/error taxonomy shared by the channel, mutex and condvar.
//!
//! Channel operations never panic: a call that can only fail because the
//! channel is closed returns a `Result` carrying the value back to the
//! caller (mirroring `std::sync::mpsc`); a call that can also time out
//! distinguishes the two outcomes. Only misuse of the fiber runtime itself
//! (suspending outside a fiber, double-joining) panics, since those are
//! precondition violations rather than runtime conditions a caller should
//! branch on.

use std::fmt;

/// A blocking send failed because the channel is closed; the value that
/// could not be delivered is returned to the caller.
#[derive(thiserror::Error)]
#[error("sending on a closed channel")]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

/// Outcome of a timed send.
#[derive(thiserror::Error)]
pub enum SendTimeoutError<T> {
    #[error("sending on a closed channel")]
    Disconnected(T),
    #[error("timed out sending on a channel")]
    Timeout(T),
}

impl<T> fmt::Debug for SendTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(_) => f.write_str("SendTimeoutError::Disconnected(..)"),
            Self::Timeout(_) => f.write_str("SendTimeoutError::Timeout(..)"),
        }
    }
}

impl<T> SendTimeoutError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Disconnected(v) | Self::Timeout(v) => v,
        }
    }
}

/// A blocking receive failed because the channel is closed and drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("receiving on a closed and empty channel")]
pub struct RecvError;

/// Outcome of a timed receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvTimeoutError {
    #[error("receiving on a closed and empty channel")]
    Disconnected,
    #[error("timed out receiving on a channel")]
    Timeout,
}
