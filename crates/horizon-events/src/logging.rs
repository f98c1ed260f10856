//! Logging and queue diagnostics.
//!
//! The runtime logs through the `tracing` crate. Install a subscriber in your
//! application to see the output:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_events::queue=trace,horizon_events=info")
//!     .init();
//! ```
//!
//! Usage errors (posting to a destroyed object, sending across threads,
//! installing a filter from another thread) are reported at `warn` or
//! `error`; queue traffic at `trace`; loop life-cycle at `debug`.
//!
//! [`QueueReport`] renders a snapshot of every thread's queue, as returned
//! by [`Runtime::queue_stats`](crate::Runtime::queue_stats):
//!
//! ```
//! use horizon_events::{Event, Runtime};
//!
//! let rt = Runtime::new().unwrap();
//! let id = rt.register_fn(|_, _| true);
//! rt.post_event(id, Event::user(1));
//! println!("{}", rt.queue_stats());
//! assert_eq!(rt.queue_stats().total_pending(), 1);
//! ```

use std::fmt;
use std::thread::ThreadId;

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Crate-wide target.
    pub const CORE: &str = "horizon_events";
    /// Posting, cancellation and draining.
    pub const QUEUE: &str = "horizon_events::queue";
    /// Filter chains and delivery.
    pub const DISPATCH: &str = "horizon_events::dispatch";
    /// Event loops and quitting.
    pub const EVENT_LOOP: &str = "horizon_events::event_loop";
    /// Object registration, destruction and thread moves.
    pub const OBJECT: &str = "horizon_events::object";
}

/// Queue state of one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// The thread.
    pub thread_id: ThreadId,
    /// The thread's name, if it has one.
    pub thread_name: Option<String>,
    /// Records in the queue, including emptied slots not yet compacted.
    pub records: usize,
    /// Events still waiting for delivery.
    pub pending: usize,
    /// Drains currently running on the queue.
    pub recursion: usize,
    /// Current dispatch depth.
    pub loop_level: u32,
    /// Event loops running on the thread.
    pub running_loops: usize,
    /// Objects living on the thread.
    pub objects: usize,
}

/// A snapshot of all queues.
#[derive(Debug, Clone)]
pub struct QueueReport {
    application: String,
    threads: Vec<QueueStats>,
}

impl QueueReport {
    pub(crate) fn new(application: String, mut threads: Vec<QueueStats>) -> Self {
        threads.sort_by(|a, b| b.pending.cmp(&a.pending));
        Self {
            application,
            threads,
        }
    }

    /// Per-thread statistics, busiest queue first.
    pub fn threads(&self) -> &[QueueStats] {
        &self.threads
    }

    /// Pending events across all threads.
    pub fn total_pending(&self) -> usize {
        self.threads.iter().map(|s| s.pending).sum()
    }
}

impl fmt::Display for QueueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Event Queues: {} ===", self.application)?;
        for stats in &self.threads {
            let name = stats.thread_name.as_deref().unwrap_or("<unnamed>");
            writeln!(
                f,
                "{name} ({:?}): {} pending, {} records, {} objects, depth {}, {} loops{}",
                stats.thread_id,
                stats.pending,
                stats.records,
                stats.objects,
                stats.loop_level,
                stats.running_loops,
                if stats.recursion > 0 { " [draining]" } else { "" },
            )?;
        }
        write!(f, "total pending: {}", self.total_pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(name: &str, pending: usize) -> QueueStats {
        QueueStats {
            thread_id: std::thread::current().id(),
            thread_name: Some(name.to_string()),
            records: pending,
            pending,
            recursion: 0,
            loop_level: 0,
            running_loops: 0,
            objects: 1,
        }
    }

    #[test]
    fn test_report_orders_busiest_first() {
        let report = QueueReport::new("app".into(), vec![stats("idle", 0), stats("busy", 4)]);
        assert_eq!(report.threads()[0].thread_name.as_deref(), Some("busy"));
        assert_eq!(report.total_pending(), 4);
    }

    #[test]
    fn test_report_format() {
        let mut draining = stats("worker", 2);
        draining.recursion = 1;
        let output = QueueReport::new("viewer".into(), vec![draining]).to_string();

        assert!(output.contains("Event Queues: viewer"));
        assert!(output.contains("worker"));
        assert!(output.contains("2 pending"));
        assert!(output.contains("[draining]"));
        assert!(output.ends_with("total pending: 2"));
    }
}
