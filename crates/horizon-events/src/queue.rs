//! The per-thread posted-event list.
//!
//! Records are only ever appended. A drain walks them from `start_offset` up
//! to the `insertion_offset` it snapshotted on entry, so anything posted while
//! it runs (including by the handlers it calls) waits for a later drain.
//! Slots are nulled rather than removed while any drain is active; physical
//! removal happens only at recursion zero.

use crate::event::{Event, EventId, EventKind};
use crate::object::ObjectId;

/// One queued `(receiver, event, priority)` triple.
///
/// A record whose event has been delivered, moved or cancelled keeps its
/// place with an empty slot until the list is compacted.
#[derive(Debug)]
pub struct PostedRecord {
    pub(crate) receiver: ObjectId,
    pub(crate) event: Option<Box<Event>>,
    pub(crate) priority: i32,
}

impl PostedRecord {
    /// The receiver this record is addressed to.
    pub fn receiver(&self) -> ObjectId {
        self.receiver
    }

    /// The queued event, or `None` for an emptied slot.
    pub fn event(&self) -> Option<&Event> {
        self.event.as_deref()
    }

    /// The priority the event was posted with.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn matches(&self, receiver: Option<ObjectId>, kind: Option<EventKind>) -> bool {
        match &self.event {
            None => false,
            Some(event) => {
                receiver.is_none_or(|r| r == self.receiver) && kind.is_none_or(|k| k == event.kind())
            }
        }
    }
}

/// Posted events of one thread, plus the drain bookkeeping.
#[derive(Debug)]
pub(crate) struct PostEventList {
    pub records: Vec<PostedRecord>,
    /// Number of drains currently active on this list.
    pub recursion: usize,
    /// Records below this index have been processed by the global drain.
    pub start_offset: usize,
    /// Records at or above this index were posted during the current drain.
    pub insertion_offset: usize,
    /// Whether the owning thread may block: nothing is left to deliver.
    pub can_wait: bool,
}

impl PostEventList {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            recursion: 0,
            start_offset: 0,
            insertion_offset: 0,
            can_wait: true,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records still holding an event.
    pub fn pending(&self) -> usize {
        self.records[self.start_offset.min(self.records.len())..]
            .iter()
            .filter(|r| r.event.is_some())
            .count()
    }

    pub fn add_event(&mut self, receiver: ObjectId, event: Box<Event>, priority: i32) {
        self.records.push(PostedRecord {
            receiver,
            event: Some(event),
            priority,
        });
    }

    /// Take every event matching the filters out of its slot.
    ///
    /// The events are handed back so the caller can drop them after releasing
    /// the queue mutex. The list only shrinks when no drain is active.
    pub fn remove_matching(
        &mut self,
        receiver: Option<ObjectId>,
        kind: Option<EventKind>,
    ) -> Vec<(ObjectId, Box<Event>)> {
        let mut removed = Vec::new();
        for record in &mut self.records {
            if !record.matches(receiver, kind) {
                continue;
            }
            if let Some(mut event) = record.event.take() {
                event.posted = false;
                removed.push((record.receiver, event));
            }
        }
        if self.recursion == 0 {
            self.retain_live();
        }
        removed
    }

    /// Take a single event out of its slot by identity.
    pub fn take_by_id(&mut self, id: EventId) -> Option<(ObjectId, Box<Event>)> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.event.as_ref().is_some_and(|e| e.id() == id))?;
        let mut event = record.event.take()?;
        event.posted = false;
        Some((record.receiver, event))
    }

    /// Take every event queued for `receiver`, still marked as posted, for
    /// re-queueing on another thread. Deferred-delete levels are reset since
    /// they only mean something on the thread that stamped them.
    pub fn take_for_receiver(&mut self, receiver: ObjectId) -> Vec<(Box<Event>, i32)> {
        let mut moved = Vec::new();
        for record in &mut self.records {
            if record.receiver != receiver {
                continue;
            }
            if let Some(mut event) = record.event.take() {
                if event.kind() == EventKind::DeferredDelete {
                    event.defer_level = None;
                }
                moved.push((event, record.priority));
            }
        }
        if self.recursion == 0 {
            self.retain_live();
        }
        moved
    }

    /// Drop the processed prefix `[0, start_offset)` after a global drain.
    pub fn compact_processed(&mut self) {
        let processed = self.start_offset.min(self.records.len());
        self.records.drain(..processed);
        self.insertion_offset = self.insertion_offset.saturating_sub(processed);
        self.start_offset = 0;
    }

    /// Remove every emptied slot, keeping both cursors pointing at the same
    /// live records. Only valid while no drain is active.
    fn retain_live(&mut self) {
        debug_assert_eq!(self.recursion, 0);
        let mut start = 0;
        let mut insertion = 0;
        let mut index = 0;
        let (old_start, old_insertion) = (self.start_offset, self.insertion_offset);
        self.records.retain(|record| {
            let keep = record.event.is_some();
            if keep {
                if index < old_start {
                    start += 1;
                }
                if index < old_insertion {
                    insertion += 1;
                }
            }
            index += 1;
            keep
        });
        self.start_offset = start;
        self.insertion_offset = insertion.max(start);
    }

    /// Take every remaining event, leaving the list empty.
    pub fn take_all(&mut self) -> Vec<(ObjectId, Box<Event>)> {
        let removed = self
            .records
            .drain(..)
            .filter_map(|r| {
                r.event.map(|mut event| {
                    event.posted = false;
                    (r.receiver, event)
                })
            })
            .collect();
        self.start_offset = 0;
        self.insertion_offset = 0;
        removed
    }
}
