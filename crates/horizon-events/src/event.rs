//! Event values delivered through the runtime.
//!
//! An [`Event`] is a single-owner value: it is moved into a queue slot when
//! posted, moved back out when delivered, and dropped exactly once afterwards.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// The kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An event with no particular meaning.
    None,
    /// A timer fired. The payload carries a [`TimerId`].
    Timer,
    /// Request to quit the loop. Compressed per receiver.
    Quit,
    /// Request to destroy the receiver once the requesting stack has unwound.
    /// Compressed per receiver.
    DeferredDelete,
    /// The receiver is about to move to another thread.
    ThreadChange,
    /// Application-defined kind.
    User(u32),
}

impl EventKind {
    /// Create an application-defined event kind.
    pub const fn user(kind: u32) -> Self {
        Self::User(kind)
    }
}

/// Priority levels for posted events.
///
/// Priorities are carried with each queued record; delivery order within a
/// queue is the order of posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum EventPriority {
    /// Background work.
    Low = -1,
    /// Most application events.
    #[default]
    Normal = 0,
    /// User input, timers.
    High = 1,
}

impl From<EventPriority> for i32 {
    fn from(priority: EventPriority) -> Self {
        priority as i32
    }
}

/// Process-unique identity of an event.
///
/// Assigned at construction, so a producer can remember it before handing the
/// event to [`Runtime::post_event`](crate::Runtime::post_event) and later
/// cancel it with [`Runtime::remove_posted_event`](crate::Runtime::remove_posted_event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    /// Get the raw u64 value of this id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_event_id() -> EventId {
    EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Identifier carried by [`EventKind::Timer`] events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

/// Opaque event payload.
pub type Payload = Box<dyn Any + Send>;

/// An event.
pub struct Event {
    id: EventId,
    kind: EventKind,
    payload: Option<Payload>,
    pub(crate) posted: bool,
    pub(crate) defer_level: Option<u32>,
}

impl Event {
    /// Create an event of the given kind with no payload.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: next_event_id(),
            kind,
            payload: None,
            posted: false,
            defer_level: None,
        }
    }

    /// Create an event carrying an opaque payload.
    pub fn with_payload<T: Any + Send>(kind: EventKind, payload: T) -> Self {
        let mut event = Self::new(kind);
        event.payload = Some(Box::new(payload));
        event
    }

    /// Create an application-defined event.
    pub fn user(kind: u32) -> Self {
        Self::new(EventKind::User(kind))
    }

    /// Create a timer event for the given timer.
    pub fn timer(id: TimerId) -> Self {
        Self::with_payload(EventKind::Timer, id)
    }

    /// Create a quit request.
    pub fn quit() -> Self {
        Self::new(EventKind::Quit)
    }

    /// Create a deferred-delete request.
    pub fn deferred_delete() -> Self {
        Self::new(EventKind::DeferredDelete)
    }

    /// The identity of this event.
    #[inline]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// The kind of this event.
    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Whether the event currently sits in a posted-event queue.
    ///
    /// Always `false` for an event a handler is looking at: the flag is
    /// cleared the moment the event is taken out of its queue slot.
    #[inline]
    pub fn is_posted(&self) -> bool {
        self.posted
    }

    /// Dispatch depth recorded when a deferred delete was posted from the
    /// receiver's own thread.
    #[inline]
    pub fn defer_level(&self) -> Option<u32> {
        self.defer_level
    }

    /// Borrow the payload as `T`, if it is one.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Mutably borrow the payload as `T`, if it is one.
    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.as_mut().and_then(|p| p.downcast_mut::<T>())
    }

    /// Take the payload out of the event.
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    /// The timer id of a timer event.
    pub fn timer_id(&self) -> Option<TimerId> {
        match self.kind {
            EventKind::Timer => self.payload::<TimerId>().copied(),
            _ => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("posted", &self.posted)
            .field("defer_level", &self.defer_level)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

static_assertions::assert_impl_all!(Event: Send);
