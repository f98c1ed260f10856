//! Posting, compression and cancellation.

use std::sync::Arc;

use crate::application::Runtime;
use crate::event::{Event, EventId, EventKind, EventPriority};
use crate::logging::targets;
use crate::object::{ObjectId, ThreadLookup};
use crate::queue::{PostEventList, PostedRecord};
use crate::thread_data::ThreadData;

/// Decides whether a newly posted event is redundant.
///
/// Consulted only when the receiver already has events queued. Runs with the
/// receiver's queue locked: implementations must not call into the
/// [`Runtime`].
pub trait CompressionPolicy: Send + Sync {
    /// Return `true` to discard `event` instead of queueing it.
    fn compress(&self, event: &Event, receiver: ObjectId, queued: &[PostedRecord]) -> bool;
}

/// The built-in compression rules.
///
/// A `Quit` or `DeferredDelete` is dropped when the same kind is already
/// queued for the receiver. With timer coalescing enabled a timer event is
/// dropped when one for the same timer id is already queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCompression {
    coalesce_timers: bool,
}

impl DefaultCompression {
    /// Create the default policy.
    pub fn new(coalesce_timers: bool) -> Self {
        Self { coalesce_timers }
    }
}

impl CompressionPolicy for DefaultCompression {
    fn compress(&self, event: &Event, receiver: ObjectId, queued: &[PostedRecord]) -> bool {
        let for_receiver = || {
            queued
                .iter()
                .filter(move |r| r.receiver() == receiver)
                .filter_map(PostedRecord::event)
        };
        match event.kind() {
            EventKind::Quit | EventKind::DeferredDelete => {
                for_receiver().any(|queued| queued.kind() == event.kind())
            }
            EventKind::Timer if self.coalesce_timers => match event.timer_id() {
                Some(timer) => for_receiver().any(|queued| queued.timer_id() == Some(timer)),
                None => false,
            },
            _ => false,
        }
    }
}

/// Why a receiver's queue could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unresolved {
    /// No such object.
    Unknown,
    /// The object is being torn down.
    Detached,
}

enum Posted {
    Queued(Arc<ThreadData>),
    Compressed(Box<Event>),
}

impl Runtime {
    /// Run `work` with the receiver's queue locked.
    ///
    /// The owning thread is re-checked once the lock is held; if the object
    /// moved in the meantime the lock is released and the new owner's queue
    /// is tried instead.
    pub(crate) fn with_receiver_queue<T>(
        &self,
        receiver: ObjectId,
        work: impl FnOnce(&mut PostEventList, &Arc<ThreadData>) -> T,
    ) -> Result<T, Unresolved> {
        let lookup = self.objects.read().thread_of(receiver);
        let mut data = match lookup {
            ThreadLookup::Thread(data) => data,
            ThreadLookup::Unknown => return Err(Unresolved::Unknown),
            ThreadLookup::Detached => return Err(Unresolved::Detached),
        };
        loop {
            let moved_to = {
                let mut list = data.posted.lock();
                let lookup = self.objects.read().thread_of(receiver);
                match lookup {
                    ThreadLookup::Thread(owner) if Arc::ptr_eq(&owner, &data) => {
                        return Ok(work(&mut *list, &data));
                    }
                    ThreadLookup::Thread(owner) => owner,
                    ThreadLookup::Unknown => return Err(Unresolved::Unknown),
                    ThreadLookup::Detached => return Err(Unresolved::Detached),
                }
            };
            data = moved_to;
        }
    }

    /// Take matching events out of a locked list and fix the receivers'
    /// posted counts. The caller drops the events after unlocking.
    pub(crate) fn take_posted(
        &self,
        list: &mut PostEventList,
        receiver: Option<ObjectId>,
        kind: Option<EventKind>,
    ) -> Vec<(ObjectId, Box<Event>)> {
        let removed = list.remove_matching(receiver, kind);
        let objects = self.objects.read();
        for (owner, _) in &removed {
            objects.decrement_posted(*owner);
        }
        removed
    }

    /// Post an event with [`EventPriority::Normal`].
    ///
    /// See [`post_event_with_priority`](Self::post_event_with_priority).
    pub fn post_event(&self, receiver: ObjectId, event: Event) -> Option<EventId> {
        self.post_event_with_priority(receiver, event, EventPriority::Normal.into())
    }

    /// Queue `event` for `receiver` and wake the receiver's thread.
    ///
    /// Callable from any thread. Returns the id of the queued event, or
    /// `None` if the event was dropped: the receiver is unknown or being
    /// destroyed, or the compression policy found it redundant.
    pub fn post_event_with_priority(
        &self,
        receiver: ObjectId,
        event: Event,
        priority: i32,
    ) -> Option<EventId> {
        let mut event = Box::new(event);
        let id = event.id();
        let policy = self.compression.read().clone();

        let outcome = self.with_receiver_queue(receiver, move |list, data| {
            let objects = self.objects.read();
            if objects.posted_count(receiver) != 0 && policy.compress(&event, receiver, &list.records) {
                return Posted::Compressed(event);
            }
            if event.kind() == EventKind::DeferredDelete && data.is_current() {
                event.defer_level = Some(data.loop_level());
            }
            event.posted = true;
            list.add_event(receiver, event, priority);
            objects.increment_posted(receiver);
            list.can_wait = false;
            Posted::Queued(data.clone())
        });

        match outcome {
            Ok(Posted::Queued(data)) => {
                tracing::trace!(target: targets::QUEUE, ?receiver, event = ?id, "posted event");
                data.wake_up();
                Some(id)
            }
            Ok(Posted::Compressed(event)) => {
                tracing::trace!(target: targets::QUEUE, ?receiver, kind = ?event.kind(), "compressed event");
                None
            }
            Err(Unresolved::Unknown) => {
                tracing::warn!(target: targets::QUEUE, ?receiver, "post_event: unknown receiver, event dropped");
                None
            }
            Err(Unresolved::Detached) => None,
        }
    }

    /// Cancel queued events.
    ///
    /// With a receiver, cancels that receiver's events (optionally only one
    /// kind); without, cancels the calling thread's events. Safe to call from
    /// inside a handler while a drain is running.
    pub fn remove_posted_events(&self, receiver: Option<ObjectId>, kind: Option<EventKind>) {
        let removed = match receiver {
            Some(id) => self
                .with_receiver_queue(id, |list, _| {
                    if self.objects.read().posted_count(id) == 0 {
                        return Vec::new();
                    }
                    self.take_posted(list, Some(id), kind)
                })
                .unwrap_or_default(),
            None => {
                let data = self.current_thread_data();
                let mut list = data.posted.lock();
                self.take_posted(&mut list, None, kind)
            }
        };
        if !removed.is_empty() {
            tracing::trace!(target: targets::QUEUE, count = removed.len(), "removed posted events");
        }
        drop(removed);
    }

    /// Cancel a single queued event of the calling thread by id.
    ///
    /// Returns `true` if the event was found and destroyed.
    pub fn remove_posted_event(&self, id: EventId) -> bool {
        let data = self.current_thread_data();
        let removed = {
            let mut list = data.posted.lock();
            let removed = list.take_by_id(id);
            if let Some((owner, _)) = &removed {
                self.objects.read().decrement_posted(*owner);
            }
            removed
        };
        match removed {
            Some(_) => true,
            None => {
                tracing::warn!(
                    target: targets::QUEUE,
                    event = ?id,
                    "remove_posted_event: event is not queued on this thread"
                );
                false
            }
        }
    }
}
