//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use horizon_events::{EventKind, ObjectId, Runtime, RuntimeBuilder};
use parking_lot::{Mutex, MutexGuard};

/// Only one runtime may be alive per process.
static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

/// A runtime owned by one test at a time.
pub struct TestRuntime {
    // Declared first so it is dropped before the lock is released.
    pub rt: Arc<Runtime>,
    _guard: MutexGuard<'static, ()>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_builder(RuntimeBuilder::new())
    }

    pub fn with_builder(builder: RuntimeBuilder) -> Self {
        init_tracing();
        let guard = RUNTIME_LOCK.lock();
        let rt = builder.build().expect("no other runtime is alive");
        Self { rt, _guard: guard }
    }
}

/// Route runtime logs to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A receiver that accepts everything and counts deliveries.
pub fn counter(rt: &Runtime) -> (ObjectId, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let count = hits.clone();
    let id = rt.register_fn(move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
        true
    });
    (id, hits)
}

/// A receiver that records the kind of every event it gets.
pub fn recorder(rt: &Runtime) -> (ObjectId, Arc<Mutex<Vec<EventKind>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let id = rt.register_fn(move |_, event| {
        log.lock().push(event.kind());
        true
    });
    (id, seen)
}

/// A late-bound object id, for handlers that need to refer to themselves or
/// to objects created after them.
#[derive(Clone, Default)]
pub struct IdSlot(Arc<Mutex<Option<ObjectId>>>);

impl IdSlot {
    pub fn set(&self, id: ObjectId) {
        *self.0.lock() = Some(id);
    }

    pub fn get(&self) -> ObjectId {
        self.0.lock().expect("slot filled before the loop runs")
    }
}
