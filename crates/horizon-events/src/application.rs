//! The runtime: process-wide dispatch state and the object API.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::event::{Event, EventKind};
use crate::logging::{QueueReport, QueueStats, targets};
use crate::object::{ObjectId, ObjectRegistry, Receiver, ThreadLookup, receiver_fn};
use crate::posting::{CompressionPolicy, DefaultCompression, Unresolved};
use crate::thread_data::{ThreadData, WaitPrimitive};

/// Set while a [`Runtime`] is alive.
static INSTANCE_ALIVE: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Dispatch state to release when the current thread exits.
    static THREAD_EXIT: RefCell<Vec<ThreadExit>> = const { RefCell::new(Vec::new()) };
}

struct ThreadExit {
    runtime: Weak<Runtime>,
    thread: ThreadId,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.upgrade() {
            rt.release_thread_data(self.thread);
        }
    }
}

/// Callback run once when the main loop is about to return.
pub type AboutToQuitHandler = Box<dyn Fn(&Runtime) + Send + Sync>;

/// Predicate consulted by [`Runtime::maybe_quit`].
pub type QuitPredicate = Arc<dyn Fn(&Runtime) -> bool + Send + Sync>;

/// The event dispatch runtime.
///
/// Holds the object registry, one posted-event queue per thread and the
/// main-loop control state. Only one `Runtime` may be alive per process; the
/// thread that creates it becomes the application thread.
///
/// # Example
///
/// ```
/// use horizon_events::{Event, EventKind, Runtime};
///
/// let rt = Runtime::new().unwrap();
/// let id = rt.register_fn(|rt, event| {
///     if event.kind() == EventKind::user(1) {
///         rt.exit(7);
///         return true;
///     }
///     false
/// });
///
/// rt.post_event(id, Event::user(1));
/// assert_eq!(rt.exec().unwrap(), 7);
/// ```
pub struct Runtime {
    self_ref: Weak<Runtime>,
    config: RuntimeConfig,
    pub(crate) objects: RwLock<ObjectRegistry>,
    threads: RwLock<HashMap<ThreadId, Arc<ThreadData>>>,
    pub(crate) main_thread: Arc<ThreadData>,
    app_object: ObjectId,
    pub(crate) compression: RwLock<Arc<dyn CompressionPolicy>>,
    /// Outstanding quit locks.
    pub(crate) quit_lock_ref: AtomicUsize,
    pub(crate) quit_lock_enabled: AtomicBool,
    /// True while [`Runtime::exec`] runs.
    pub(crate) in_exec: AtomicBool,
    pub(crate) about_to_quit_emitted: AtomicBool,
    pub(crate) about_to_quit: Mutex<Vec<AboutToQuitHandler>>,
    pub(crate) should_quit: RwLock<Option<QuitPredicate>>,
    closing: AtomicBool,
}

/// Receiver behind [`Runtime::application_object`].
struct ApplicationObject;

impl Receiver for ApplicationObject {
    fn event(&self, rt: &Runtime, event: &mut Event) -> bool {
        match event.kind() {
            EventKind::Quit => {
                rt.quit();
                true
            }
            _ => false,
        }
    }
}

impl Runtime {
    /// Create the runtime with the default configuration.
    ///
    /// The calling thread becomes the application thread.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ApplicationAlreadyInitialized`] if another
    /// runtime is alive in this process.
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create the runtime with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ApplicationAlreadyInitialized`] if another
    /// runtime is alive in this process.
    pub fn with_config(config: RuntimeConfig) -> Result<Arc<Self>> {
        if INSTANCE_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!(target: targets::CORE, "a Runtime is already alive");
            return Err(RuntimeError::ApplicationAlreadyInitialized);
        }

        let current = std::thread::current();
        let main_thread = Arc::new(ThreadData::new(
            current.id(),
            current.name().map(str::to_owned),
        ));

        let mut objects = ObjectRegistry::new();
        let app_object = objects.register(
            Arc::new(ApplicationObject),
            "ApplicationObject",
            main_thread.clone(),
        );

        let mut threads = HashMap::new();
        threads.insert(current.id(), main_thread.clone());

        let compression: Arc<dyn CompressionPolicy> =
            Arc::new(DefaultCompression::new(config.coalesce_timers));

        tracing::debug!(
            target: targets::CORE,
            name = %config.application_name,
            coalesce_timers = config.coalesce_timers,
            "runtime created"
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            quit_lock_enabled: AtomicBool::new(config.quit_lock_enabled),
            config,
            objects: RwLock::new(objects),
            threads: RwLock::new(threads),
            main_thread,
            app_object,
            compression: RwLock::new(compression),
            quit_lock_ref: AtomicUsize::new(0),
            in_exec: AtomicBool::new(false),
            about_to_quit_emitted: AtomicBool::new(false),
            about_to_quit: Mutex::new(Vec::new()),
            should_quit: RwLock::new(None),
            closing: AtomicBool::new(false),
        }))
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The application object. It lives on the application thread, quits the
    /// main loop when it receives [`EventKind::Quit`], and its filters are the
    /// application-wide filters.
    pub fn application_object(&self) -> ObjectId {
        self.app_object
    }

    /// Whether the calling thread is the application thread.
    pub fn is_application_thread(&self) -> bool {
        self.main_thread.is_current()
    }

    /// Whether the runtime has entered its closing-down phase.
    pub fn is_closing_down(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Replace the compression policy consulted by `post_event`.
    ///
    /// The policy runs while the target queue is locked and must not call
    /// back into the runtime.
    pub fn set_compression_policy(&self, policy: Arc<dyn CompressionPolicy>) {
        *self.compression.write() = policy;
    }

    /// Install a custom wait primitive for the calling thread.
    ///
    /// This is the seam a platform event source uses to block in its own
    /// message loop while the runtime has nothing to deliver.
    pub fn install_wait_primitive(&self, waiter: Arc<dyn WaitPrimitive>) {
        self.current_thread_data().set_waiter(waiter);
    }

    // -------------------------------------------------------------------------
    // Thread data
    // -------------------------------------------------------------------------

    /// Dispatch state of the calling thread, created on first use.
    ///
    /// State of threads other than the application thread is released when
    /// the thread exits, unless objects still live on it.
    pub(crate) fn current_thread_data(&self) -> Arc<ThreadData> {
        let current = std::thread::current();
        let existing = self.threads.read().get(&current.id()).cloned();
        let data = match existing {
            Some(data) => data,
            None => self
                .threads
                .write()
                .entry(current.id())
                .or_insert_with(|| {
                    tracing::trace!(target: targets::CORE, thread = ?current.id(), "new thread data");
                    Arc::new(ThreadData::new(current.id(), current.name().map(str::to_owned)))
                })
                .clone(),
        };
        if !Arc::ptr_eq(&data, &self.main_thread) && data.claim_exit_hook() {
            let exit = ThreadExit {
                runtime: self.self_ref.clone(),
                thread: current.id(),
            };
            // Fails only while the thread is already tearing down.
            let _ = THREAD_EXIT.try_with(|hooks| hooks.borrow_mut().push(exit));
        }
        data
    }

    /// Forget an exited thread's dispatch state if no object lives on it.
    fn release_thread_data(&self, thread: ThreadId) {
        let released = {
            let mut threads = self.threads.write();
            let Some(data) = threads.get(&thread) else {
                return;
            };
            if Arc::ptr_eq(data, &self.main_thread) || self.objects.read().objects_on(data) > 0 {
                return;
            }
            threads.remove(&thread)
        };
        if let Some(data) = released {
            let discarded = data.posted.lock().take_all();
            drop(discarded);
            tracing::trace!(target: targets::CORE, ?thread, "released thread data");
        }
    }

    /// Dispatch state of an arbitrary thread, created on first use.
    pub(crate) fn thread_data_for(&self, thread: ThreadId) -> Arc<ThreadData> {
        if let Some(data) = self.threads.read().get(&thread) {
            return data.clone();
        }
        self.threads
            .write()
            .entry(thread)
            .or_insert_with(|| Arc::new(ThreadData::new(thread, None)))
            .clone()
    }

    fn all_thread_data(&self) -> Vec<Arc<ThreadData>> {
        self.threads.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Object API
    // -------------------------------------------------------------------------

    /// Register a receiver. It lives on the calling thread.
    pub fn register<R: Receiver>(&self, receiver: Arc<R>) -> ObjectId {
        let thread = self.current_thread_data();
        self.objects
            .write()
            .register(receiver, std::any::type_name::<R>(), thread)
    }

    /// Register a closure as a receiver. It lives on the calling thread.
    pub fn register_fn<F>(&self, handler: F) -> ObjectId
    where
        F: Fn(&Runtime, &mut Event) -> bool + Send + Sync + 'static,
    {
        self.register(Arc::new(receiver_fn(handler)))
    }

    /// Whether `id` refers to a live object.
    pub fn contains_object(&self, id: ObjectId) -> bool {
        self.objects.read().contains(id)
    }

    /// Number of live objects, including the application object.
    pub fn object_count(&self) -> usize {
        self.objects.read().object_count()
    }

    /// Set an object's diagnostic name.
    pub fn set_object_name(&self, id: ObjectId, name: impl Into<String>) -> Result<()> {
        if self.objects.write().set_name(id, name.into()) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidObject(id))
        }
    }

    /// An object's diagnostic name.
    pub fn object_name(&self, id: ObjectId) -> Option<String> {
        self.objects.read().name(id).map(str::to_owned)
    }

    /// The Rust type name an object was registered with.
    pub fn object_type_name(&self, id: ObjectId) -> Option<&'static str> {
        self.objects.read().type_name(id)
    }

    /// The thread an object lives on. `None` for unknown objects and for
    /// objects being destroyed.
    pub fn object_thread(&self, id: ObjectId) -> Option<ThreadId> {
        match self.objects.read().thread_of(id) {
            ThreadLookup::Thread(data) => Some(data.thread_id()),
            ThreadLookup::Unknown | ThreadLookup::Detached => None,
        }
    }

    /// Destroy an object immediately.
    ///
    /// The object is first detached from its thread so concurrent posts are
    /// dropped, then its queued events are cancelled, then it leaves the
    /// registry. A handler already running for it finishes normally.
    pub fn destroy_object(&self, id: ObjectId) -> Result<()> {
        if id == self.app_object {
            tracing::warn!(target: targets::OBJECT, "the application object cannot be destroyed");
            return Err(RuntimeError::ApplicationObject);
        }

        let cancelled = match self.with_receiver_queue(id, |list, _| {
            self.objects.write().set_thread(id, None);
            self.take_posted(list, Some(id), None)
        }) {
            Ok(cancelled) => cancelled,
            Err(Unresolved::Unknown) => return Err(RuntimeError::InvalidObject(id)),
            // Another caller is already tearing it down.
            Err(Unresolved::Detached) => return Ok(()),
        };
        drop(cancelled);

        let receiver = self.objects.write().remove(id);
        tracing::trace!(target: targets::OBJECT, ?id, "destroyed object");
        drop(receiver);
        Ok(())
    }

    /// Schedule an object for destruction once control returns to an event
    /// loop at or above the current dispatch depth.
    pub fn delete_later(&self, id: ObjectId) {
        self.post_event(id, Event::deferred_delete());
    }

    /// Move an object to another thread.
    ///
    /// Must be called from the object's current thread. The object receives
    /// a synchronous [`EventKind::ThreadChange`] first; afterwards its queued
    /// events are moved to the target thread's queue, which is woken.
    pub fn move_to_thread(&self, id: ObjectId, target: ThreadId) -> Result<()> {
        if id == self.app_object {
            return Err(RuntimeError::ApplicationObject);
        }
        let lookup = self.objects.read().thread_of(id);
        let current = match lookup {
            ThreadLookup::Thread(data) => data,
            ThreadLookup::Unknown | ThreadLookup::Detached => {
                return Err(RuntimeError::InvalidObject(id));
            }
        };
        if !current.is_current() {
            tracing::warn!(
                target: targets::OBJECT,
                ?id,
                "move_to_thread: current thread is not the object's thread"
            );
            return Err(RuntimeError::WrongThread { object: id });
        }
        if current.thread_id() == target {
            return Ok(());
        }

        let mut event = Event::new(EventKind::ThreadChange);
        self.send_event(id, &mut event);

        let target_data = self.thread_data_for(target);
        let moved = {
            let mut list = current.posted.lock();
            let moved = list.take_for_receiver(id);
            self.objects.write().set_thread(id, Some(target_data.clone()));
            moved
        };

        let mut orphaned = Vec::new();
        if !moved.is_empty() {
            let mut list = target_data.posted.lock();
            let still_here = matches!(
                self.objects.read().thread_of(id),
                ThreadLookup::Thread(ref data) if Arc::ptr_eq(data, &target_data)
            );
            if still_here {
                for (event, priority) in moved {
                    list.add_event(id, event, priority);
                }
                list.can_wait = false;
            } else {
                orphaned = moved;
            }
        }
        drop(orphaned);

        tracing::debug!(target: targets::OBJECT, ?id, ?target, "moved object to thread");
        target_data.wake_up();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shutdown and diagnostics
    // -------------------------------------------------------------------------

    /// Enter the closing-down phase.
    ///
    /// Fires the about-to-quit handlers if they have not run yet and, on the
    /// application thread, flushes pending deferred deletes. Afterwards
    /// `notify` no longer delivers and every queued event is discarded.
    pub fn shutdown(&self) {
        if self.is_closing_down() {
            return;
        }
        self.emit_about_to_quit();
        if self.is_application_thread() {
            self.send_posted_events(None, Some(EventKind::DeferredDelete));
        }
        self.closing.store(true, Ordering::Release);
        self.clear_queues();
        tracing::debug!(target: targets::EVENT_LOOP, "runtime closing down");
    }

    fn clear_queues(&self) {
        for data in self.all_thread_data() {
            let discarded = {
                let mut list = data.posted.lock();
                let discarded = list.take_all();
                let objects = self.objects.read();
                for (owner, _) in &discarded {
                    objects.decrement_posted(*owner);
                }
                discarded
            };
            // Dropped with no queue locked.
            drop(discarded);
        }
    }

    /// Number of events queued for the calling thread.
    pub fn posted_event_count(&self) -> usize {
        self.current_thread_data().posted.lock().pending()
    }

    /// A snapshot of every thread's queue.
    pub fn queue_stats(&self) -> QueueReport {
        let threads = self.all_thread_data();
        let mut stats: Vec<QueueStats> = threads
            .iter()
            .map(|data| {
                let list = data.posted.lock();
                QueueStats {
                    thread_id: data.thread_id(),
                    thread_name: data.name().map(str::to_owned),
                    records: list.len(),
                    pending: list.pending(),
                    recursion: list.recursion,
                    loop_level: data.loop_level(),
                    running_loops: data.loop_count(),
                    objects: 0,
                }
            })
            .collect();
        let objects = self.objects.read();
        for (entry, data) in stats.iter_mut().zip(&threads) {
            entry.objects = objects.objects_on(data);
        }
        QueueReport::new(self.config.application_name.clone(), stats)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.clear_queues();
        INSTANCE_ALIVE.store(false, Ordering::Release);
        tracing::debug!(target: targets::CORE, "runtime dropped");
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("application_name", &self.config.application_name)
            .field("main_thread", &self.main_thread.thread_id())
            .field("objects", &self.objects.read().object_count())
            .field("in_exec", &self.in_exec.load(Ordering::Relaxed))
            .field("closing", &self.is_closing_down())
            .finish()
    }
}

static_assertions::assert_impl_all!(Runtime: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRuntime;

    #[test]
    fn test_second_runtime_is_refused() {
        let t = TestRuntime::new();
        assert_eq!(
            Runtime::new().unwrap_err(),
            RuntimeError::ApplicationAlreadyInitialized
        );
        drop(t);
    }

    #[test]
    fn test_object_metadata() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let id = rt.register_fn(|_, _| false);

        assert!(rt.contains_object(id));
        assert_eq!(rt.object_name(id).as_deref(), Some(""));
        rt.set_object_name(id, "button").unwrap();
        assert_eq!(rt.object_name(id).as_deref(), Some("button"));
        assert_eq!(rt.object_thread(id), Some(std::thread::current().id()));
        assert!(rt.object_type_name(id).unwrap().contains("FnReceiver"));
    }

    #[test]
    fn test_destroy_cancels_posted_events() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = rt.register_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        rt.post_event(id, Event::user(1));
        rt.post_event(id, Event::user(2));
        assert_eq!(rt.posted_event_count(), 2);

        rt.destroy_object(id).unwrap();
        assert!(!rt.contains_object(id));
        assert_eq!(rt.posted_event_count(), 0);
        assert_eq!(rt.send_posted_events(None, None), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(rt.destroy_object(id), Err(RuntimeError::InvalidObject(id)));
    }

    #[test]
    fn test_application_object_is_protected() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let app = rt.application_object();
        assert_eq!(rt.destroy_object(app), Err(RuntimeError::ApplicationObject));
        assert!(rt.contains_object(app));
    }

    #[test]
    fn test_shutdown_discards_queued_events() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = rt.register_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        rt.post_event(id, Event::user(1));
        rt.post_event(id, Event::user(2));
        rt.shutdown();
        assert!(rt.is_closing_down());
        assert_eq!(rt.posted_event_count(), 0);
        assert_eq!(rt.objects.read().posted_count(id), 0);

        // Synchronous delivery is suppressed once closing down.
        assert!(rt.send_event(id, &mut Event::user(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_queue_stats() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let id = rt.register_fn(|_, _| true);
        rt.post_event(id, Event::user(1));

        let report = rt.queue_stats();
        let main = report
            .threads()
            .iter()
            .find(|s| s.thread_id == std::thread::current().id())
            .unwrap();
        assert_eq!(main.pending, 1);
        // The application object and the test receiver.
        assert_eq!(main.objects, 2);
        assert_eq!(report.total_pending(), 1);
    }
}
