//! Synchronous delivery and event filters.
//!
//! # Event Flow
//!
//! When an event is delivered to an object, the following steps occur:
//!
//! 1. **Application filters**: filters installed with
//!    [`Runtime::install_application_filter`] see every event, most recently
//!    installed first. A filter returning `true` consumes the event.
//!
//! 2. **Object filters**: the receiver's own filters, in the same order.
//!
//! 3. **Handler**: the receiver's [`Receiver::event`](crate::Receiver::event).
//!    A [`EventKind::DeferredDelete`] that gets this far destroys the
//!    receiver once the handler returns.
//!
//! Filters are only consulted when they live on the receiver's thread. An
//! application filter silently ignores events on other threads; an object
//! filter on the wrong thread is skipped with a warning. Each chain is a
//! snapshot of object ids, re-validated one by one, so filters may install or
//! remove filters (themselves included) while running.

use std::sync::Arc;

use crate::application::Runtime;
use crate::error::{Result, RuntimeError};
use crate::event::{Event, EventKind};
use crate::logging::targets;
use crate::object::{ObjectId, ThreadLookup};
use crate::thread_data::ThreadData;

/// Which filter chain is being walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterScope {
    Application,
    Object,
}

impl Runtime {
    /// Deliver an event synchronously.
    ///
    /// The caller must be on the receiver's thread; otherwise the call is
    /// logged as a usage error and `false` is returned without delivering.
    pub fn send_event(&self, receiver: ObjectId, event: &mut Event) -> bool {
        let lookup = self.objects.read().thread_of(receiver);
        match lookup {
            ThreadLookup::Unknown => {
                tracing::warn!(target: targets::DISPATCH, ?receiver, "send_event: unknown receiver");
                false
            }
            ThreadLookup::Detached => false,
            ThreadLookup::Thread(data) if !data.is_current() => {
                tracing::error!(
                    target: targets::DISPATCH,
                    ?receiver,
                    kind = ?event.kind(),
                    "send_event: cannot send events to objects owned by a different thread"
                );
                false
            }
            ThreadLookup::Thread(_) => self.notify_internal(receiver, event),
        }
    }

    /// [`notify`](Self::notify) inside one level of dispatch depth.
    pub(crate) fn notify_internal(&self, receiver: ObjectId, event: &mut Event) -> bool {
        let data = self.current_thread_data();
        let _level = data.enter_dispatch();
        self.notify(receiver, event)
    }

    /// Run the filter chains and the handler for one event.
    pub(crate) fn notify(&self, receiver: ObjectId, event: &mut Event) -> bool {
        if self.is_closing_down() {
            return true;
        }

        let target = self.objects.read().dispatch_target(receiver);
        let Some(target) = target else {
            tracing::warn!(
                target: targets::DISPATCH,
                ?receiver,
                kind = ?event.kind(),
                "notify: receiver no longer exists"
            );
            return true;
        };
        let Some(thread) = target.thread else {
            return true;
        };
        if !thread.is_current() {
            tracing::error!(
                target: targets::DISPATCH,
                ?receiver,
                "notify: receiver lives in a different thread"
            );
            return false;
        }

        let app_filters = self.objects.read().filters(self.application_object());
        if self.run_filters(FilterScope::Application, &app_filters, &thread, receiver, event) {
            return true;
        }
        if receiver != self.application_object()
            && self.run_filters(FilterScope::Object, &target.filters, &thread, receiver, event)
        {
            return true;
        }

        let handled = target.receiver.event(self, event);
        if event.kind() == EventKind::DeferredDelete {
            if let Err(err) = self.destroy_object(receiver) {
                tracing::debug!(target: targets::OBJECT, ?receiver, %err, "deferred delete skipped");
            }
            return true;
        }
        handled
    }

    fn run_filters(
        &self,
        scope: FilterScope,
        filters: &[ObjectId],
        thread: &Arc<ThreadData>,
        watched: ObjectId,
        event: &mut Event,
    ) -> bool {
        for &filter in filters.iter().rev() {
            let entry = self.objects.read().dispatch_target(filter);
            let Some(entry) = entry else {
                continue;
            };
            if !entry.thread.as_ref().is_some_and(|t| Arc::ptr_eq(t, thread)) {
                // Application filters only see their own thread's events.
                if scope == FilterScope::Application {
                    continue;
                }
                tracing::warn!(
                    target: targets::DISPATCH,
                    ?filter,
                    ?watched,
                    "event filter lives in a different thread than the receiver, skipped"
                );
                continue;
            }
            if entry.receiver.event_filter(self, watched, event) {
                tracing::trace!(target: targets::DISPATCH, ?filter, ?watched, "event consumed by filter");
                return true;
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Filter API
    // -------------------------------------------------------------------------

    /// Install `filter` on `target`.
    ///
    /// Both objects must live on the same thread. Installing a filter that is
    /// already present moves it to the front of the chain.
    pub fn install_event_filter(&self, target: ObjectId, filter: ObjectId) -> Result<()> {
        if target == self.application_object() {
            return self.install_application_filter(filter);
        }
        let mut objects = self.objects.write();
        let (target_thread, filter_thread) = match (objects.thread_of(target), objects.thread_of(filter)) {
            (ThreadLookup::Thread(t), ThreadLookup::Thread(f)) => (t, f),
            (ThreadLookup::Thread(_), _) => return Err(RuntimeError::InvalidObject(filter)),
            _ => return Err(RuntimeError::InvalidObject(target)),
        };
        if !Arc::ptr_eq(&target_thread, &filter_thread) {
            tracing::warn!(
                target: targets::DISPATCH,
                ?target,
                ?filter,
                "install_event_filter: cannot filter events for objects in a different thread"
            );
            return Err(RuntimeError::FilterThreadMismatch { target, filter });
        }
        objects.install_filter(target, filter);
        Ok(())
    }

    /// Remove `filter` from `target`. Returns `true` if it was installed.
    pub fn remove_event_filter(&self, target: ObjectId, filter: ObjectId) -> bool {
        self.objects.write().remove_filter(target, filter)
    }

    /// Install an application-wide filter that sees events for every object
    /// on the filter's thread.
    pub fn install_application_filter(&self, filter: ObjectId) -> Result<()> {
        let mut objects = self.objects.write();
        if !objects.contains(filter) {
            return Err(RuntimeError::InvalidObject(filter));
        }
        objects.install_filter(self.application_object(), filter);
        Ok(())
    }

    /// Remove an application-wide filter. Returns `true` if it was installed.
    pub fn remove_application_filter(&self, filter: ObjectId) -> bool {
        self.objects
            .write()
            .remove_filter(self.application_object(), filter)
    }

    /// The filters installed on `target`, in the order they are consulted.
    pub fn event_filters(&self, target: ObjectId) -> Vec<ObjectId> {
        let mut filters = self.objects.read().filters(target);
        filters.reverse();
        filters
    }
}
