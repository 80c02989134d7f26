//! A single-writer, multi-subscriber broadcast sink, keyed by its payload
//! type.
//!
//! `Broadcast::<Args>::global()` returns the one instance shared by every
//! caller that names the same `Args` type, without the caller declaring a
//! `static` anywhere — Rust has no way to write a generic `static` closing
//! over a function's type parameter, so the single instance per `Args` is
//! kept in a type-erased registry instead, downcast back on lookup. This is
//! the same shape `log`'s own global logger registration uses, generalized
//! from one fixed type to a family of them.
//!
//! `notify` is documented as single-writer: nothing stops two fibers or
//! threads from calling it concurrently, but doing so only serializes the
//! two calls against each other (via the internal `std::sync::Mutex`), with
//! no guarantee about ordering relative to a concurrent `connect`/drop of a
//! [`Subscription`] on a third thread. A subscriber that panics is let run
//! to completion of its unwind inside the locked section, which poisons the
//! underlying mutex exactly as any `std::sync::Mutex` does — this is the
//! stricter of the two behaviors such a panic could reasonably have, on the
//! premise that a subscriber bad enough to panic has probably left shared
//! state in a shape nothing should keep publishing into. Recover with
//! [`Broadcast::clear_poison`] once the subscriber in question has been
//! disconnected.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::spinlock::Spinlock;

type Subscriber<Args> = Box<dyn FnMut(&Args) + Send + 'static>;

struct Inner<Args> {
    next_id: u64,
    subscribers: Vec<(u64, Subscriber<Args>)>,
}

/// A broadcast sink for values of type `Args`.
///
/// Cloning a `Broadcast` is cheap and yields a handle to the same
/// underlying sink.
pub struct Broadcast<Args: 'static> {
    inner: Arc<Mutex<Inner<Args>>>,
}

impl<Args> Clone for Broadcast<Args> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

type Registry = Spinlock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Spinlock::new(HashMap::new()))
}

impl<Args: Send + 'static> Broadcast<Args> {
    /// Returns the process-wide sink for this `Args` type, creating it on
    /// first use.
    pub fn global() -> Self {
        let mut map = registry().lock();
        let entry = map.entry(TypeId::of::<Args>()).or_insert_with(|| {
            Box::new(Broadcast::<Args>::new()) as Box<dyn Any + Send + Sync>
        });
        entry
            .downcast_ref::<Broadcast<Args>>()
            .expect("registry entry type mismatch for TypeId::of::<Args>()")
            .clone()
    }

    /// Creates an independent sink, not reachable through
    /// [`global`](Self::global). Useful for tests or for scoping a sink to
    /// something narrower than the whole process.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Registers `callback` to be invoked on every future
    /// [`notify`](Self::notify). Dropping the returned [`Subscription`]
    /// unregisters it.
    ///
    /// # Panics
    /// Panics if the sink is poisoned (see the module documentation).
    pub fn connect<F>(&self, callback: F) -> Subscription<Args>
    where
        F: FnMut(&Args) + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("broadcast sink poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, Box::new(callback)));
        Subscription {
            broadcast: self.clone(),
            id,
        }
    }

    /// Delivers `args` to every connected subscriber, in connection order.
    ///
    /// If a subscriber panics, the panic propagates out of this call
    /// exactly as it occurred — subscribers after the panicking one are
    /// not invoked — and the sink's internal mutex is left poisoned, so
    /// every subsequent call into this `Broadcast` (on any clone of it)
    /// panics too, until [`clear_poison`](Self::clear_poison) is called.
    ///
    /// # Panics
    /// Panics if a subscriber panics, or if the sink is already poisoned
    /// from a previous call.
    pub fn notify(&self, args: Args) {
        let mut inner = self.inner.lock().expect("broadcast sink poisoned");
        for (id, subscriber) in inner.subscribers.iter_mut() {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subscriber(&args)));
            if let Err(payload) = result {
                log::warn!(target: "fibra::broadcast", "subscriber {id} panicked during notify, poisoning sink");
                std::panic::resume_unwind(payload);
            }
        }
    }

    /// Clears poisoning left by a subscriber panic inside
    /// [`notify`](Self::notify), allowing the sink to be used again.
    pub fn clear_poison(&self) {
        self.inner.clear_poison();
    }

    /// Returns `true` if a previous [`notify`](Self::notify) call left the
    /// sink poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.inner.is_poisoned()
    }

    fn disconnect(&self, id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

impl<Args: Send + 'static> Default for Broadcast<Args> {
    fn default() -> Self {
        Self::new()
    }
}

/// An RAII handle returned by [`Broadcast::connect`]; dropping it
/// unregisters the associated callback.
pub struct Subscription<Args: 'static> {
    broadcast: Broadcast<Args>,
    id: u64,
}

impl<Args: Send + 'static> Drop for Subscription<Args> {
    fn drop(&mut self) {
        self.broadcast.disconnect(self.id);
    }
}
