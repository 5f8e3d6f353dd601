//! Runtime error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the runtime's public operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The task set was closed; no further spawns are accepted.
    #[error("task set is closed")]
    SetClosed,

    /// A bounded queue rejected the operation because it was full.
    #[error("queue is full")]
    QueueFull,

    /// The target reactor has stopped and no longer accepts work.
    #[error("reactor has stopped")]
    ReactorStopped,

    /// The runtime has been shut down.
    #[error("runtime is shut down")]
    Shutdown,

    /// The blocking pool could not accept the job before the deadline.
    #[error("blocking pool submission timed out after {0:?}")]
    BlockingTimeout(Duration),
}
