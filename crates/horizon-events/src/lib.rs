//! Event dispatch core for Horizon.
//!
//! This crate provides the machinery every other part of a Horizon
//! application delivers events through:
//!
//! - **Posted-event queues**: one per thread, safe to post to from anywhere,
//!   drained by the owning thread without ever starving its loop
//! - **Compression**: redundant `Quit`, `DeferredDelete` and (optionally)
//!   timer events are dropped at post time
//! - **Filter chains**: application-wide and per-object event filters, most
//!   recently installed first
//! - **Deferred deletion**: objects destroyed only once control is back in a
//!   loop shallower than the handler that asked
//! - **Event loops**: nestable loops, `exec`/`exit`/`quit`, and quit locks
//!   that end the application when the last piece of work lets go
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use horizon_events::{Event, EventKind, Runtime};
//!
//! let rt = Runtime::new().unwrap();
//! let seen = Arc::new(AtomicUsize::new(0));
//!
//! let counter = seen.clone();
//! let worker = rt.register_fn(move |rt, event| match event.kind() {
//!     EventKind::User(1) => {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!         true
//!     }
//!     EventKind::User(2) => {
//!         rt.quit();
//!         true
//!     }
//!     _ => false,
//! });
//!
//! rt.post_event(worker, Event::user(1));
//! rt.post_event(worker, Event::user(1));
//! rt.post_event(worker, Event::user(2));
//!
//! assert_eq!(rt.exec().unwrap(), 0);
//! assert_eq!(seen.load(Ordering::SeqCst), 2);
//! ```
//!
//! # Threads
//!
//! Objects live on the thread that registered them. Any thread may post to
//! any object; delivery always happens on the object's thread, inside that
//! thread's [`EventLoop`] or an explicit [`Runtime::send_posted_events`].
//! Synchronous [`Runtime::send_event`] requires the caller to be on the
//! receiver's thread.

mod application;
mod config;
mod dispatch;
mod drain;
mod error;
mod event;
mod event_loop;
pub mod logging;
pub mod object;
mod posting;
mod queue;
mod thread_data;

pub use application::{AboutToQuitHandler, QuitPredicate, Runtime};
pub use config::{RuntimeBuilder, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use event::{Event, EventId, EventKind, EventPriority, Payload, TimerId};
pub use event_loop::{EventLoop, ProcessEventsFlags, QuitLock};
pub use logging::{QueueReport, QueueStats};
pub use object::{FnFilter, FnReceiver, ObjectId, Receiver, filter_fn, receiver_fn};
pub use posting::{CompressionPolicy, DefaultCompression};
pub use queue::PostedRecord;
pub use thread_data::{ChannelWaiter, WaitPrimitive};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use parking_lot::{Mutex, MutexGuard};

    use crate::application::Runtime;

    /// Only one runtime may be alive per process.
    static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

    /// A runtime owned by one test at a time.
    pub(crate) struct TestRuntime {
        // Declared first so it is dropped before the lock is released.
        pub rt: Arc<Runtime>,
        _guard: MutexGuard<'static, ()>,
    }

    impl TestRuntime {
        pub fn new() -> Self {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
            let guard = RUNTIME_LOCK.lock();
            let rt = Runtime::new().expect("no other runtime is alive");
            Self { rt, _guard: guard }
        }
    }
}
