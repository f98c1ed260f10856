//! Per-thread dispatch state.
//!
//! Every thread that owns objects or runs an event loop gets one
//! [`ThreadData`]. It holds the thread's posted-event list, the primitive the
//! thread blocks on while idle, and the nesting counters the deferred-delete
//! rule depends on.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use crossbeam_channel::{Receiver as ChannelReceiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::event_loop::LoopState;
use crate::logging::targets;
use crate::queue::PostEventList;

/// Something a thread can block on until there is work.
///
/// Install a custom primitive with
/// [`Runtime::install_wait_primitive`](crate::Runtime::install_wait_primitive)
/// to integrate the runtime into a platform loop; otherwise a channel-based
/// one is created the first time the thread processes events.
pub trait WaitPrimitive: Send + Sync {
    /// Wake the owning thread. Must not block and may be called from any
    /// thread. A wake-up that arrives while the thread is not waiting must
    /// make its next wait return immediately.
    fn wake_up(&self);

    /// Block until woken or until `timeout` expires. Returns `true` if the
    /// thread was woken.
    fn wait_for_work(&self, timeout: Option<Duration>) -> bool;
}

/// The default [`WaitPrimitive`]: a single-slot channel.
///
/// A wake-up sent while nobody waits is latched, so a post racing with the
/// decision to block is never lost.
pub struct ChannelWaiter {
    sender: Sender<()>,
    receiver: ChannelReceiver<()>,
}

impl ChannelWaiter {
    /// Create a new waiter.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        Self { sender, receiver }
    }
}

impl Default for ChannelWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitPrimitive for ChannelWaiter {
    fn wake_up(&self) {
        match self.sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::warn!(target: targets::EVENT_LOOP, "wake-up channel disconnected");
            }
        }
    }

    fn wait_for_work(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            None => self.receiver.recv().is_ok(),
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
            },
        }
    }
}

impl fmt::Debug for ChannelWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWaiter")
            .field("pending", &!self.receiver.is_empty())
            .finish()
    }
}

/// Dispatch state of one thread.
pub(crate) struct ThreadData {
    thread_id: ThreadId,
    name: Option<String>,
    /// The posted-event list. Lock order: this mutex before the registry.
    pub posted: Mutex<PostEventList>,
    waiter: RwLock<Option<Arc<dyn WaitPrimitive>>>,
    /// Current dispatch depth on this thread.
    loop_level: AtomicU32,
    /// Running event loops, innermost last.
    event_loops: Mutex<Vec<Arc<LoopState>>>,
    /// Set by an application-wide exit, cleared when the main loop returns.
    quit_now: AtomicBool,
    /// Whether the thread-exit release has been scheduled.
    exit_hooked: AtomicBool,
}

impl ThreadData {
    pub fn new(thread_id: ThreadId, name: Option<String>) -> Self {
        Self {
            thread_id,
            name,
            posted: Mutex::new(PostEventList::new()),
            waiter: RwLock::new(None),
            loop_level: AtomicU32::new(0),
            event_loops: Mutex::new(Vec::new()),
            quit_now: AtomicBool::new(false),
            exit_hooked: AtomicBool::new(false),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the calling thread is the thread this data belongs to.
    #[inline]
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Wake the thread if it has a wait primitive.
    pub fn wake_up(&self) {
        let waiter = self.waiter.read().clone();
        if let Some(waiter) = waiter {
            waiter.wake_up();
        }
    }

    /// Install the default waiter if none is present, and return the active
    /// one.
    pub fn ensure_waiter(&self) -> Arc<dyn WaitPrimitive> {
        if let Some(waiter) = self.waiter.read().as_ref() {
            return waiter.clone();
        }
        let mut slot = self.waiter.write();
        slot.get_or_insert_with(|| Arc::new(ChannelWaiter::new()) as Arc<dyn WaitPrimitive>)
            .clone()
    }

    pub fn set_waiter(&self, waiter: Arc<dyn WaitPrimitive>) {
        *self.waiter.write() = Some(waiter);
    }

    pub fn has_waiter(&self) -> bool {
        self.waiter.read().is_some()
    }

    #[inline]
    pub fn loop_level(&self) -> u32 {
        self.loop_level.load(Ordering::Acquire)
    }

    /// Enter one dispatch level. The level drops again when the guard does,
    /// including during unwinding.
    pub fn enter_dispatch(&self) -> DispatchLevel<'_> {
        self.loop_level.fetch_add(1, Ordering::AcqRel);
        DispatchLevel { data: self }
    }

    pub fn push_loop(&self, state: Arc<LoopState>) {
        self.event_loops.lock().push(state);
    }

    pub fn pop_loop(&self, state: &Arc<LoopState>) {
        let mut loops = self.event_loops.lock();
        if let Some(pos) = loops.iter().rposition(|l| Arc::ptr_eq(l, state)) {
            loops.remove(pos);
        }
    }

    pub fn loops(&self) -> Vec<Arc<LoopState>> {
        self.event_loops.lock().clone()
    }

    pub fn loop_count(&self) -> usize {
        self.event_loops.lock().len()
    }

    pub fn quit_now(&self) -> bool {
        self.quit_now.load(Ordering::Acquire)
    }

    pub fn set_quit_now(&self, value: bool) {
        self.quit_now.store(value, Ordering::Release);
    }

    /// Returns `true` exactly once, for the caller that should schedule the
    /// release of this data at thread exit.
    pub fn claim_exit_hook(&self) -> bool {
        !self.exit_hooked.load(Ordering::Acquire) && !self.exit_hooked.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for ThreadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadData")
            .field("thread_id", &self.thread_id)
            .field("name", &self.name)
            .field("loop_level", &self.loop_level())
            .field("has_waiter", &self.has_waiter())
            .finish()
    }
}

/// Guard for one level of dispatch depth. See [`ThreadData::enter_dispatch`].
pub(crate) struct DispatchLevel<'a> {
    data: &'a ThreadData,
}

impl Drop for DispatchLevel<'_> {
    fn drop(&mut self) {
        self.data.loop_level.fetch_sub(1, Ordering::AcqRel);
    }
}

static_assertions::assert_impl_all!(ThreadData: Send, Sync);

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_latched_wake_up() {
        let waiter = ChannelWaiter::new();
        waiter.wake_up();
        waiter.wake_up();
        assert!(waiter.wait_for_work(Some(Duration::from_millis(10))));
        // The second wake-up coalesced into the first.
        assert!(!waiter.wait_for_work(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wait_times_out() {
        let waiter = ChannelWaiter::new();
        let start = Instant::now();
        assert!(!waiter.wait_for_work(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cross_thread_wake_up() {
        let data = Arc::new(ThreadData::new(std::thread::current().id(), None));
        let waiter = data.ensure_waiter();

        let remote = data.clone();
        let handle = std::thread::spawn(move || remote.wake_up());
        assert!(waiter.wait_for_work(Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }

    #[test]
    fn test_wake_without_waiter_is_noop() {
        let data = ThreadData::new(std::thread::current().id(), Some("main".into()));
        data.wake_up();
        assert!(!data.has_waiter());
        assert_eq!(data.name(), Some("main"));
        assert!(data.is_current());
    }

    #[test]
    fn test_dispatch_level_guard() {
        let data = ThreadData::new(std::thread::current().id(), None);
        {
            let _outer = data.enter_dispatch();
            let _inner = data.enter_dispatch();
            assert_eq!(data.loop_level(), 2);
        }
        assert_eq!(data.loop_level(), 0);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _level = data.enter_dispatch();
            panic!("handler failure");
        }));
        assert!(result.is_err());
        assert_eq!(data.loop_level(), 0);
    }
}
