//! Event loops and main-loop control.
//!
//! An [`EventLoop`] repeatedly drains its thread's queue and blocks on the
//! thread's wait primitive until [`EventLoop::exit`] is called. Loops nest:
//! a handler may run another loop, which must exit before the handler
//! returns. [`Runtime::exec`] runs the outermost loop of the application
//! thread and owns the quit decision.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::application::Runtime;
use crate::error::{Result, RuntimeError};
use crate::event::{Event, EventKind};
use crate::logging::targets;
use crate::thread_data::ThreadData;

/// Flags controlling [`Runtime::process_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessEventsFlags(u32);

impl ProcessEventsFlags {
    /// Deliver everything that is pending, then return.
    pub const ALL_EVENTS: Self = Self(0);
    /// Block until woken when nothing is pending.
    pub const WAIT_FOR_MORE_EVENTS: Self = Self(1 << 0);
    /// Also run a deferred-delete pass first.
    pub const DEFERRED_DELETION: Self = Self(1 << 1);

    /// Returns true if every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// These flags with everything in `other` cleared.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for ProcessEventsFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ProcessEventsFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Shared state of one [`EventLoop`].
pub(crate) struct LoopState {
    exit: AtomicBool,
    return_code: AtomicI32,
    in_exec: AtomicBool,
    /// The thread running the loop, while it runs.
    thread: Mutex<Option<Arc<ThreadData>>>,
}

impl LoopState {
    fn new() -> Self {
        Self {
            exit: AtomicBool::new(false),
            return_code: AtomicI32::new(0),
            in_exec: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub fn exit(&self, code: i32) {
        self.return_code.store(code, Ordering::Release);
        self.exit.store(true, Ordering::Release);
        let thread = self.thread.lock().clone();
        if let Some(thread) = thread {
            thread.wake_up();
        }
    }
}

/// A handle to an event loop.
///
/// Clones share the same loop, so a clone can be handed to another thread
/// (or captured by a handler) to exit it.
#[derive(Clone)]
pub struct EventLoop {
    state: Arc<LoopState>,
}

/// Unbinds a loop from its thread when `exec` returns or unwinds.
struct Running<'a> {
    state: &'a Arc<LoopState>,
    data: Arc<ThreadData>,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.data.pop_loop(self.state);
        *self.state.thread.lock() = None;
        self.state.in_exec.store(false, Ordering::Release);
    }
}

impl EventLoop {
    /// Create a loop that is not running yet.
    pub fn new() -> Self {
        Self {
            state: Arc::new(LoopState::new()),
        }
    }

    /// Run the loop on the calling thread until [`exit`](Self::exit) is
    /// called. Returns the exit code.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::LoopAlreadyRunning`] if this loop is already
    /// running (on any thread), or [`RuntimeError::QuitPending`] if this is
    /// the application thread and the application is quitting.
    pub fn exec(&self, rt: &Runtime) -> Result<i32> {
        let data = rt.current_thread_data();
        if data.quit_now() {
            tracing::debug!(target: targets::EVENT_LOOP, "quit pending, event loop not started");
            return Err(RuntimeError::QuitPending);
        }
        if self.state.in_exec.swap(true, Ordering::AcqRel) {
            tracing::warn!(target: targets::EVENT_LOOP, "EventLoop::exec: instance already running");
            return Err(RuntimeError::LoopAlreadyRunning);
        }

        self.state.exit.store(false, Ordering::Release);
        *self.state.thread.lock() = Some(data.clone());
        data.push_loop(self.state.clone());
        let _running = Running {
            state: &self.state,
            data: data.clone(),
        };
        let _level = data.enter_dispatch();

        tracing::debug!(target: targets::EVENT_LOOP, nesting = data.loop_count(), "entering event loop");
        while !self.state.exit.load(Ordering::Acquire) {
            rt.process_events(ProcessEventsFlags::WAIT_FOR_MORE_EVENTS);
        }
        let code = self.state.return_code.load(Ordering::Acquire);
        tracing::debug!(target: targets::EVENT_LOOP, code, "leaving event loop");
        Ok(code)
    }

    /// Make the loop return `code`. Callable from any thread.
    pub fn exit(&self, code: i32) {
        self.state.exit(code);
    }

    /// `exit(0)`.
    pub fn quit(&self) {
        self.exit(0);
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.state.in_exec.load(Ordering::Acquire)
    }

    /// Wake the thread running this loop, if any.
    pub fn wake_up(&self) {
        let thread = self.state.thread.lock().clone();
        if let Some(thread) = thread {
            thread.wake_up();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .field("exit", &self.state.exit.load(Ordering::Relaxed))
            .finish()
    }
}

/// A quit lock. While any is held, releasing work does not end the main
/// loop; dropping the last one calls [`Runtime::maybe_quit`].
#[must_use = "the lock is released as soon as it is dropped"]
pub struct QuitLock<'a> {
    rt: &'a Runtime,
}

impl Drop for QuitLock<'_> {
    fn drop(&mut self) {
        if self.rt.quit_lock_ref.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.rt.maybe_quit();
        }
    }
}

impl fmt::Debug for QuitLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuitLock")
            .field("outstanding", &self.rt.quit_lock_count())
            .finish()
    }
}

/// Clears the runtime's exec flag when the main loop returns or unwinds.
struct ExecFlag<'a>(&'a AtomicBool);

impl Drop for ExecFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Runtime {
    // -------------------------------------------------------------------------
    // Event processing
    // -------------------------------------------------------------------------

    /// Deliver the calling thread's pending events once.
    ///
    /// With [`ProcessEventsFlags::WAIT_FOR_MORE_EVENTS`], blocks on the
    /// thread's wait primitive when nothing was delivered and nothing is
    /// left to deliver. Returns `true` if any event was delivered.
    pub fn process_events(&self, flags: ProcessEventsFlags) -> bool {
        let data = self.current_thread_data();
        let waiter = data.ensure_waiter();

        if flags.contains(ProcessEventsFlags::DEFERRED_DELETION) {
            self.drain(&data, None, Some(EventKind::DeferredDelete));
        }
        let delivered = self.drain(&data, None, None);

        if delivered == 0 && flags.contains(ProcessEventsFlags::WAIT_FOR_MORE_EVENTS) {
            let can_wait = data.posted.lock().can_wait;
            if can_wait {
                tracing::trace!(target: targets::EVENT_LOOP, "waiting for events");
                waiter.wait_for_work(self.config().idle_timeout);
            }
        }
        delivered > 0
    }

    /// Deliver pending events for up to `max_time`, never blocking.
    pub fn process_events_for(&self, flags: ProcessEventsFlags, max_time: Duration) {
        let start = Instant::now();
        let deferred = flags.contains(ProcessEventsFlags::DEFERRED_DELETION);
        let flags = flags
            .without(ProcessEventsFlags::WAIT_FOR_MORE_EVENTS)
            .without(ProcessEventsFlags::DEFERRED_DELETION);

        if deferred {
            self.send_posted_events(None, Some(EventKind::DeferredDelete));
        }
        while self.process_events(flags) {
            if start.elapsed() > max_time {
                break;
            }
            if deferred {
                self.send_posted_events(None, Some(EventKind::DeferredDelete));
            }
        }
    }

    /// Whether the calling thread has queued events.
    pub fn has_pending_events(&self) -> bool {
        self.current_thread_data().posted.lock().pending() > 0
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run the main event loop until [`exit`](Self::exit) is called.
    ///
    /// On return the about-to-quit handlers run (once per runtime) and a
    /// final deferred-delete pass is flushed.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotApplicationThread`] when called off the
    /// application thread and [`RuntimeError::LoopAlreadyRunning`] when a
    /// loop is already running there.
    #[tracing::instrument(skip(self), target = "horizon_events::event_loop", level = "debug")]
    pub fn exec(&self) -> Result<i32> {
        if !self.is_application_thread() {
            tracing::error!(target: targets::EVENT_LOOP, "exec: must be called from the application thread");
            return Err(RuntimeError::NotApplicationThread { operation: "exec" });
        }
        if self.main_thread.loop_count() > 0 {
            tracing::warn!(target: targets::EVENT_LOOP, "exec: the event loop is already running");
            return Err(RuntimeError::LoopAlreadyRunning);
        }

        self.main_thread.set_quit_now(false);
        self.in_exec.store(true, Ordering::Release);
        let result = {
            let _exec = ExecFlag(&self.in_exec);
            EventLoop::new().exec(self)
        };
        // Cleared before about-to-quit so its handlers may run loops.
        self.main_thread.set_quit_now(false);
        let code = result?;

        self.emit_about_to_quit();
        self.send_posted_events(None, Some(EventKind::DeferredDelete));
        tracing::info!(target: targets::EVENT_LOOP, code, "event loop finished");
        Ok(code)
    }

    /// Ask every loop of the application thread to return `code`.
    ///
    /// Callable from any thread. Until the main loop has returned, new loops
    /// on the application thread refuse to start.
    pub fn exit(&self, code: i32) {
        tracing::info!(target: targets::EVENT_LOOP, code, "exit requested");
        self.main_thread.set_quit_now(true);
        for state in self.main_thread.loops() {
            state.exit(code);
        }
    }

    /// `exit(0)`.
    pub fn quit(&self) {
        self.exit(0);
    }

    /// Whether the main loop is running.
    pub fn is_running(&self) -> bool {
        self.in_exec.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Quit locks
    // -------------------------------------------------------------------------

    /// Post a quit request to the application object if nothing holds the
    /// application open.
    ///
    /// Requires that no quit lock is held, the main loop is running, quit
    /// locking is enabled and the quit predicate agrees. The request is
    /// posted rather than acted on so that repeated calls collapse into one.
    pub fn maybe_quit(&self) {
        if self.quit_lock_ref.load(Ordering::Acquire) != 0
            || !self.in_exec.load(Ordering::Acquire)
            || !self.quit_lock_enabled.load(Ordering::Acquire)
            || !self.quit_allowed()
        {
            return;
        }
        tracing::debug!(target: targets::EVENT_LOOP, "last quit lock released, quitting");
        self.post_event(self.application_object(), Event::quit());
    }

    /// Take a quit lock.
    pub fn quit_lock(&self) -> QuitLock<'_> {
        self.quit_lock_ref.fetch_add(1, Ordering::AcqRel);
        QuitLock { rt: self }
    }

    /// Number of quit locks currently held.
    pub fn quit_lock_count(&self) -> usize {
        self.quit_lock_ref.load(Ordering::Acquire)
    }

    /// Enable or disable ending the main loop when the last quit lock is
    /// released.
    pub fn set_quit_lock_enabled(&self, enabled: bool) {
        self.quit_lock_enabled.store(enabled, Ordering::Release);
    }

    /// Whether quit locking is enabled.
    pub fn is_quit_lock_enabled(&self) -> bool {
        self.quit_lock_enabled.load(Ordering::Acquire)
    }

    /// Install the predicate [`maybe_quit`](Self::maybe_quit) consults.
    /// Without one, quitting is always allowed.
    pub fn set_quit_predicate<F>(&self, predicate: F)
    where
        F: Fn(&Runtime) -> bool + Send + Sync + 'static,
    {
        *self.should_quit.write() = Some(Arc::new(predicate));
    }

    fn quit_allowed(&self) -> bool {
        let predicate = self.should_quit.read().clone();
        predicate.is_none_or(|p| p(self))
    }

    /// Register a handler that runs once, when the main loop first returns
    /// (or at [`shutdown`](Self::shutdown) if it never ran).
    pub fn on_about_to_quit<F>(&self, handler: F)
    where
        F: Fn(&Runtime) + Send + Sync + 'static,
    {
        self.about_to_quit.lock().push(Box::new(handler));
    }

    pub(crate) fn emit_about_to_quit(&self) {
        if self.about_to_quit_emitted.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers = std::mem::take(&mut *self.about_to_quit.lock());
        tracing::debug!(target: targets::EVENT_LOOP, handlers = handlers.len(), "about to quit");
        for handler in &handlers {
            handler(self);
        }
    }
}

static_assertions::assert_impl_all!(EventLoop: Send, Sync);

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::test_support::TestRuntime;

    #[test]
    fn test_flags() {
        let flags = ProcessEventsFlags::WAIT_FOR_MORE_EVENTS | ProcessEventsFlags::DEFERRED_DELETION;
        assert!(flags.contains(ProcessEventsFlags::DEFERRED_DELETION));
        assert!(flags.contains(ProcessEventsFlags::ALL_EVENTS));
        let flags = flags.without(ProcessEventsFlags::WAIT_FOR_MORE_EVENTS);
        assert!(!flags.contains(ProcessEventsFlags::WAIT_FOR_MORE_EVENTS));
        assert_eq!(ProcessEventsFlags::default(), ProcessEventsFlags::ALL_EVENTS);
    }

    #[test]
    fn test_exit_from_first_drain() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let id = rt.register_fn(|rt, _| {
            rt.exit(7);
            true
        });
        rt.post_event(id, Event::user(1));

        assert_eq!(rt.exec(), Ok(7));
        assert!(!rt.is_running());
        assert_eq!(rt.main_thread.loop_count(), 0);
        assert_eq!(rt.main_thread.loop_level(), 0);
    }

    #[test]
    fn test_exec_rejected_while_running() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let nested = Arc::new(Mutex::new(None));
        let slot = nested.clone();
        let id = rt.register_fn(move |rt, _| {
            *slot.lock() = Some(rt.exec());
            rt.quit();
            true
        });
        rt.post_event(id, Event::user(1));

        assert_eq!(rt.exec(), Ok(0));
        assert_eq!(*nested.lock(), Some(Err(RuntimeError::LoopAlreadyRunning)));
    }

    #[test]
    fn test_exec_off_application_thread() {
        let t = TestRuntime::new();
        let rt = t.rt.clone();
        let result = std::thread::spawn(move || rt.exec()).join().unwrap();
        assert_eq!(
            result,
            Err(RuntimeError::NotApplicationThread { operation: "exec" })
        );
    }

    #[test]
    fn test_quit_now_blocks_new_loops() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let nested = Arc::new(Mutex::new(None));
        let slot = nested.clone();
        let id = rt.register_fn(move |rt, _| {
            rt.exit(1);
            *slot.lock() = Some(EventLoop::new().exec(rt));
            true
        });
        rt.post_event(id, Event::user(1));

        assert_eq!(rt.exec(), Ok(1));
        assert_eq!(*nested.lock(), Some(Err(RuntimeError::QuitPending)));
    }

    #[test]
    fn test_loop_runs_after_exec_returned() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let quitter = rt.register_fn(|rt, _| {
            rt.quit();
            true
        });
        rt.post_event(quitter, Event::user(1));
        assert_eq!(rt.exec(), Ok(0));

        let modal = EventLoop::new();
        let handle = modal.clone();
        let closer = rt.register_fn(move |_, _| {
            handle.exit(9);
            true
        });
        rt.post_event(closer, Event::user(1));
        assert_eq!(modal.exec(rt), Ok(9));
    }

    #[test]
    fn test_loop_runs_inside_about_to_quit() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let modal = EventLoop::new();
        let handle = modal.clone();
        let closer = rt.register_fn(move |_, _| {
            handle.exit(4);
            true
        });
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        rt.on_about_to_quit(move |rt| {
            rt.post_event(closer, Event::user(1));
            *slot.lock() = Some(modal.exec(rt));
        });

        let quitter = rt.register_fn(|rt, _| {
            rt.exit(2);
            true
        });
        rt.post_event(quitter, Event::user(1));
        assert_eq!(rt.exec(), Ok(2));
        assert_eq!(*outcome.lock(), Some(Ok(4)));
    }

    #[test]
    fn test_about_to_quit_runs_once() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        rt.on_about_to_quit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = rt.register_fn(|rt, _| {
            rt.quit();
            true
        });

        rt.post_event(id, Event::user(1));
        assert_eq!(rt.exec(), Ok(0));
        rt.post_event(id, Event::user(1));
        assert_eq!(rt.exec(), Ok(0));
        rt.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_last_quit_lock_quits() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let id = rt.register_fn(|rt, _| {
            let first = rt.quit_lock();
            let second = rt.quit_lock();
            assert_eq!(rt.quit_lock_count(), 2);
            drop(first);
            drop(second);
            true
        });
        rt.post_event(id, Event::user(1));

        assert_eq!(rt.exec(), Ok(0));
        assert_eq!(rt.quit_lock_count(), 0);
    }

    #[test]
    fn test_quit_lock_respects_predicate_and_switch() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        rt.set_quit_predicate(|_| false);
        let id = rt.register_fn(|rt, event| {
            match event.kind() {
                EventKind::User(1) => drop(rt.quit_lock()),
                _ => rt.exit(3),
            }
            true
        });
        rt.post_event(id, Event::user(1));
        rt.post_event(id, Event::user(2));
        assert_eq!(rt.exec(), Ok(3));

        rt.set_quit_predicate(|_| true);
        rt.set_quit_lock_enabled(false);
        assert!(!rt.is_quit_lock_enabled());
        rt.post_event(id, Event::user(1));
        rt.post_event(id, Event::user(2));
        assert_eq!(rt.exec(), Ok(3));
    }

    #[test]
    fn test_maybe_quit_outside_exec_is_noop() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        drop(rt.quit_lock());
        assert_eq!(rt.posted_event_count(), 0);
    }

    #[test]
    fn test_process_events_without_waiting() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = rt.register_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        assert!(!rt.process_events(ProcessEventsFlags::ALL_EVENTS));
        rt.post_event(id, Event::user(1));
        assert!(rt.has_pending_events());
        assert!(rt.process_events(ProcessEventsFlags::ALL_EVENTS));
        assert!(!rt.has_pending_events());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_process_events_deferred_deletion() {
        let t = TestRuntime::new();
        let rt = &t.rt;
        let id = rt.register_fn(|_, _| false);
        rt.delete_later(id);

        // Outside any loop a plain pass leaves it queued.
        rt.process_events(ProcessEventsFlags::ALL_EVENTS);
        assert!(rt.contains_object(id));

        rt.process_events_for(ProcessEventsFlags::DEFERRED_DELETION, Duration::from_millis(10));
        assert!(!rt.contains_object(id));
    }
}
