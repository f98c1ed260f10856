//! Draining a thread's posted-event queue.
//!
//! A drain snapshots the queue length on entry and never looks past it, so a
//! receiver that keeps reposting to itself cannot starve the loop. The queue
//! mutex is released around every delivery; handlers may post, cancel and
//! start nested drains freely. A nested global drain continues from the same
//! `start_offset` as the drain it interrupted.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::application::Runtime;
use crate::event::EventKind;
use crate::logging::targets;
use crate::object::{ObjectId, ThreadLookup};
use crate::queue::{PostEventList, PostedRecord};
use crate::thread_data::ThreadData;

/// Whether a deferred delete stamped at `posted` may run at dispatch depth
/// `current`.
///
/// A delete requested inside a handler waits until control is back in a loop
/// shallower than that handler; one requested outside any handler waits for
/// the first loop. A targeted deferred-delete drain also accepts the exact
/// depth it was requested at.
pub(crate) fn deferred_delete_allowed(posted: Option<u32>, current: u32, targeted: bool) -> bool {
    let posted = posted.unwrap_or(0);
    posted > current || (posted == 0 && current > 0) || (targeted && posted == current)
}

/// One active drain. Holds the queue lock except while a handler runs, and
/// restores the queue bookkeeping when dropped, including during unwinding.
struct DrainPass<'a> {
    data: &'a ThreadData,
    list: MutexGuard<'a, PostEventList>,
    global: bool,
}

impl Drop for DrainPass<'_> {
    fn drop(&mut self) {
        let list = &mut *self.list;
        if std::thread::panicking() {
            list.can_wait = false;
        }
        list.recursion -= 1;
        let wake = list.recursion == 0 && !list.can_wait;
        if self.global && list.recursion == 0 {
            list.compact_processed();
        }
        if wake {
            self.data.wake_up();
        }
    }
}

impl Runtime {
    /// Deliver queued events of the calling thread.
    ///
    /// With no filters this is the global drain the event loop runs. A
    /// `receiver` restricts delivery to that object (which must live on the
    /// calling thread), a `kind` to one event kind. Events posted while the
    /// drain runs are left for the next one.
    ///
    /// Returns the number of events delivered.
    pub fn send_posted_events(&self, receiver: Option<ObjectId>, kind: Option<EventKind>) -> usize {
        let data = match receiver {
            Some(id) => {
                let lookup = self.objects.read().thread_of(id);
                match lookup {
                    ThreadLookup::Thread(data) => data,
                    ThreadLookup::Unknown | ThreadLookup::Detached => return 0,
                }
            }
            None => self.current_thread_data(),
        };
        if !data.is_current() {
            tracing::warn!(
                target: targets::QUEUE,
                ?receiver,
                "send_posted_events: cannot send posted events for objects in another thread"
            );
            return 0;
        }
        self.drain(&data, receiver, kind)
    }

    pub(crate) fn drain(
        &self,
        data: &Arc<ThreadData>,
        receiver: Option<ObjectId>,
        kind: Option<EventKind>,
    ) -> usize {
        let global = receiver.is_none() && kind.is_none();
        let targeted_delete = kind == Some(EventKind::DeferredDelete);

        let mut pass = DrainPass {
            data,
            list: data.posted.lock(),
            global,
        };
        pass.list.recursion += 1;
        pass.list.can_wait = pass.list.is_empty();
        if pass.list.is_empty() {
            return 0;
        }
        if let Some(id) = receiver
            && self.objects.read().posted_count(id) == 0
        {
            return 0;
        }
        pass.list.can_wait = true;
        pass.list.insertion_offset = pass.list.len();

        let mut cursor = pass.list.start_offset;
        let mut delivered = 0;
        loop {
            let list = &mut *pass.list;
            let i = if global { list.start_offset } else { cursor };
            if i >= list.insertion_offset.min(list.len()) {
                break;
            }
            if global {
                list.start_offset += 1;
            } else {
                cursor += 1;
            }

            let record = &mut list.records[i];
            if record.event.is_none() {
                continue;
            }
            if !record.matches(receiver, kind) {
                list.can_wait = false;
                continue;
            }
            let target = record.receiver;
            let priority = record.priority;
            let Some(mut event) = record.event.take() else {
                continue;
            };

            if event.kind() == EventKind::DeferredDelete
                && !deferred_delete_allowed(event.defer_level(), data.loop_level(), targeted_delete)
            {
                if global {
                    // Retry on a later pass.
                    list.records.push(PostedRecord {
                        receiver: target,
                        event: Some(event),
                        priority,
                    });
                } else {
                    list.records[i].event = Some(event);
                }
                continue;
            }

            event.posted = false;
            self.objects.read().decrement_posted(target);
            delivered += 1;

            MutexGuard::unlocked(&mut pass.list, move || {
                let mut event = event;
                self.notify_internal(target, &mut event);
            });
        }

        tracing::trace!(target: targets::QUEUE, delivered, global, "drained posted events");
        delivered
    }
}
