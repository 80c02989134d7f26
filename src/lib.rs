//! A cooperative fiber runtime: stackful, user-space "green threads" that
//! are scheduled onto OS threads explicitly, plus the synchronization
//! primitives that make waiting between them coordinate correctly — an
//! unbuffered rendezvous channel, a mutex/condvar pair, and a type-keyed
//! broadcast sink.
//!
//! A [`Scheduler`] owns one OS thread's worth of fibers. Spawn work onto it
//! with [`fiber::spawn`] from inside a running fiber, or
//! [`Scheduler::run`] to drive a freshly built one. Fibers never migrate
//! between schedulers once spawned.
//!
//! ```no_run
//! use fibra::{fiber, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! // `Scheduler::spawn` seeds the very first fiber before the run loop
//! // starts; every fiber spawned after that (including nested spawns)
//! // uses the ambient `fiber::spawn` from inside a running fiber.
//! scheduler
//!     .spawn(|| {
//!         let worker = fiber::spawn(|| 6 * 7);
//!         assert_eq!(worker.join().unwrap(), 42);
//!     })
//!     .unwrap();
//! scheduler.run();
//! ```

mod context;
mod error;
pub mod fiber;
mod scheduler;
mod spinlock;
pub mod sync;
mod wait_queue;

pub use context::{current, try_current, DEFAULT_STACK_SIZE};
pub use error::{RecvError, RecvTimeoutError, SendError, SendTimeoutError};
pub use fiber::{JoinHandle, PanicPayload};
pub use scheduler::Scheduler;
