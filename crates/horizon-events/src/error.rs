//! Error types for the Horizon event runtime.

use crate::object::ObjectId;

/// A specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors reported by fallible runtime operations.
///
/// Misuse on the hot paths (posting to a destroyed object, sending across
/// threads) is logged and degraded instead; these variants cover the calls
/// where the caller can meaningfully react.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// A runtime is already alive in this process.
    #[error("a Runtime is already alive in this process")]
    ApplicationAlreadyInitialized,

    /// The operation must run on the thread that created the runtime.
    #[error("{operation} must be called from the application thread")]
    NotApplicationThread {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The event loop is already running.
    #[error("the event loop is already running")]
    LoopAlreadyRunning,

    /// A quit was requested before the loop could start.
    #[error("a quit is pending on this thread; the loop was not started")]
    QuitPending,

    /// The object id is unknown or the object has been destroyed.
    #[error("invalid or destroyed object {0:?}")]
    InvalidObject(ObjectId),

    /// The object lives on a different thread than the caller.
    #[error("object {object:?} cannot be accessed from this thread")]
    WrongThread {
        /// The object that was accessed.
        object: ObjectId,
    },

    /// An event filter must live on the same thread as the object it watches.
    #[error("filter {filter:?} does not live on the same thread as {target:?}")]
    FilterThreadMismatch {
        /// The object the filter was to be installed on.
        target: ObjectId,
        /// The filter object.
        filter: ObjectId,
    },

    /// The application object cannot be destroyed or moved.
    #[error("operation not permitted on the application object")]
    ApplicationObject,
}
