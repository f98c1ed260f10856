//! Receivers and the object registry.
//!
//! Anything that wants events implements [`Receiver`] and is registered with a
//! [`Runtime`](crate::Runtime), which hands back an [`ObjectId`]. The id is a
//! generation-checked arena key: queues hold ids rather than references, and
//! every delivery re-validates the id against the registry, so an event can
//! never reach an object that has already been destroyed.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use horizon_events::{Event, EventKind, Receiver, Runtime};
//!
//! struct Counter {
//!     hits: AtomicUsize,
//! }
//!
//! impl Receiver for Counter {
//!     fn event(&self, _rt: &Runtime, event: &mut Event) -> bool {
//!         if event.kind() == EventKind::user(1) {
//!             self.hits.fetch_add(1, Ordering::SeqCst);
//!             return true;
//!         }
//!         false
//!     }
//! }
//!
//! let rt = Runtime::new().unwrap();
//! let counter = Arc::new(Counter { hits: AtomicUsize::new(0) });
//! let id = rt.register(counter.clone());
//!
//! rt.post_event(id, Event::user(1));
//! rt.send_posted_events(None, None);
//! assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use slotmap::{SlotMap, new_key_type};

use crate::application::Runtime;
use crate::event::Event;
use crate::logging::targets;
use crate::thread_data::ThreadData;

new_key_type! {
    /// A handle to a registered receiver.
    ///
    /// Ids are never reused: once the object is destroyed, the id stays
    /// invalid even if its slot is recycled.
    pub struct ObjectId;
}

impl ObjectId {
    /// Convert the id to a raw u64 value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }
}

/// The capability every event receiver implements.
///
/// Handlers run on the receiver's thread, never concurrently with each other
/// for the same thread, but they may re-enter the runtime: posting, sending
/// and draining from inside a handler are all allowed.
pub trait Receiver: Send + Sync + 'static {
    /// Handle an event. Returns `true` if the event was recognized.
    fn event(&self, rt: &Runtime, event: &mut Event) -> bool;

    /// Inspect an event addressed to `watched` before it is delivered.
    ///
    /// Only called while this object is installed as a filter on `watched`
    /// (or application-wide). Returning `true` consumes the event.
    fn event_filter(&self, rt: &Runtime, watched: ObjectId, event: &mut Event) -> bool {
        let _ = (rt, watched, event);
        false
    }
}

/// A receiver backed by a closure. See [`receiver_fn`].
pub struct FnReceiver<F> {
    handler: F,
}

impl<F> Receiver for FnReceiver<F>
where
    F: Fn(&Runtime, &mut Event) -> bool + Send + Sync + 'static,
{
    fn event(&self, rt: &Runtime, event: &mut Event) -> bool {
        (self.handler)(rt, event)
    }
}

/// Wrap a closure as a [`Receiver`].
pub fn receiver_fn<F>(handler: F) -> FnReceiver<F>
where
    F: Fn(&Runtime, &mut Event) -> bool + Send + Sync + 'static,
{
    FnReceiver { handler }
}

/// A filter-only object backed by a closure. See [`filter_fn`].
pub struct FnFilter<F> {
    filter: F,
}

impl<F> Receiver for FnFilter<F>
where
    F: Fn(&Runtime, ObjectId, &mut Event) -> bool + Send + Sync + 'static,
{
    fn event(&self, _rt: &Runtime, _event: &mut Event) -> bool {
        false
    }

    fn event_filter(&self, rt: &Runtime, watched: ObjectId, event: &mut Event) -> bool {
        (self.filter)(rt, watched, event)
    }
}

/// Wrap a closure as an event filter object.
pub fn filter_fn<F>(filter: F) -> FnFilter<F>
where
    F: Fn(&Runtime, ObjectId, &mut Event) -> bool + Send + Sync + 'static,
{
    FnFilter { filter }
}

/// Result of resolving an object's owning thread.
pub(crate) enum ThreadLookup {
    /// No such object.
    Unknown,
    /// The object exists but is being torn down and no longer has a queue.
    Detached,
    /// The object lives on this thread.
    Thread(Arc<ThreadData>),
}

/// Everything `notify` needs, cloned out so no lock is held during delivery.
pub(crate) struct DispatchTarget {
    pub receiver: Arc<dyn Receiver>,
    pub thread: Option<Arc<ThreadData>>,
    pub filters: Vec<ObjectId>,
}

struct ObjectEntry {
    name: String,
    type_name: &'static str,
    receiver: Arc<dyn Receiver>,
    thread: Option<Arc<ThreadData>>,
    /// Event filters, in installation order. Dispatch walks them in reverse.
    filters: Vec<ObjectId>,
    /// Number of events currently queued for this object.
    posted_events: AtomicUsize,
}

/// Arena of all live receivers.
pub(crate) struct ObjectRegistry {
    objects: SlotMap<ObjectId, ObjectEntry>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: SlotMap::with_key(),
        }
    }

    pub fn register(
        &mut self,
        receiver: Arc<dyn Receiver>,
        type_name: &'static str,
        thread: Arc<ThreadData>,
    ) -> ObjectId {
        let id = self.objects.insert(ObjectEntry {
            name: String::new(),
            type_name,
            receiver,
            thread: Some(thread),
            filters: Vec::new(),
            posted_events: AtomicUsize::new(0),
        });
        tracing::trace!(target: targets::OBJECT, ?id, type_name, "registered object");
        id
    }

    /// Remove an object, returning its receiver so the caller can drop it
    /// outside the registry lock.
    pub fn remove(&mut self, id: ObjectId) -> Option<Arc<dyn Receiver>> {
        let entry = self.objects.remove(id)?;
        for other in self.objects.values_mut() {
            other.filters.retain(|&f| f != id);
        }
        Some(entry.receiver)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn thread_of(&self, id: ObjectId) -> ThreadLookup {
        match self.objects.get(id) {
            None => ThreadLookup::Unknown,
            Some(entry) => match &entry.thread {
                None => ThreadLookup::Detached,
                Some(thread) => ThreadLookup::Thread(thread.clone()),
            },
        }
    }

    pub fn set_thread(&mut self, id: ObjectId, thread: Option<Arc<ThreadData>>) {
        if let Some(entry) = self.objects.get_mut(id) {
            entry.thread = thread;
        }
    }

    pub fn name(&self, id: ObjectId) -> Option<&str> {
        self.objects.get(id).map(|e| e.name.as_str())
    }

    pub fn set_name(&mut self, id: ObjectId, name: String) -> bool {
        match self.objects.get_mut(id) {
            Some(entry) => {
                entry.name = name;
                true
            }
            None => false,
        }
    }

    pub fn type_name(&self, id: ObjectId) -> Option<&'static str> {
        self.objects.get(id).map(|e| e.type_name)
    }

    pub fn posted_count(&self, id: ObjectId) -> usize {
        self.objects
            .get(id)
            .map_or(0, |e| e.posted_events.load(Ordering::Acquire))
    }

    pub fn increment_posted(&self, id: ObjectId) {
        if let Some(entry) = self.objects.get(id) {
            entry.posted_events.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn decrement_posted(&self, id: ObjectId) {
        if let Some(entry) = self.objects.get(id) {
            let previous = entry.posted_events.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "posted event count underflow for {id:?}");
        }
    }

    pub fn dispatch_target(&self, id: ObjectId) -> Option<DispatchTarget> {
        self.objects.get(id).map(|e| DispatchTarget {
            receiver: e.receiver.clone(),
            thread: e.thread.clone(),
            filters: e.filters.clone(),
        })
    }

    /// Install `filter` on `target`. Re-installing moves it to the front of
    /// the chain.
    pub fn install_filter(&mut self, target: ObjectId, filter: ObjectId) -> bool {
        match self.objects.get_mut(target) {
            Some(entry) => {
                entry.filters.retain(|&f| f != filter);
                entry.filters.push(filter);
                true
            }
            None => false,
        }
    }

    pub fn remove_filter(&mut self, target: ObjectId, filter: ObjectId) -> bool {
        match self.objects.get_mut(target) {
            Some(entry) => {
                let before = entry.filters.len();
                entry.filters.retain(|&f| f != filter);
                entry.filters.len() != before
            }
            None => false,
        }
    }

    pub fn filters(&self, target: ObjectId) -> Vec<ObjectId> {
        self.objects
            .get(target)
            .map(|e| e.filters.clone())
            .unwrap_or_default()
    }

    /// Objects living on `thread`.
    pub fn objects_on(&self, thread: &Arc<ThreadData>) -> usize {
        self.objects
            .values()
            .filter(|e| e.thread.as_ref().is_some_and(|t| Arc::ptr_eq(t, thread)))
            .count()
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.objects.len())
            .finish()
    }
}
