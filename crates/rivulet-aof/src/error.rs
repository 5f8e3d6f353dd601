//! Error types for append-only file operations.

/// Errors that can occur on an append-only file or its manager.
#[derive(Debug, thiserror::Error)]
pub enum AofError {
    /// A truncate is in flight; retry the non-blocking write later.
    #[error("write would block: file growth in progress")]
    WouldBlock,

    /// The file reached its maximum size; no further appends fit.
    #[error("append-only file is full")]
    Full,

    /// A bounded retry loop exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A write or append was called with zero bytes.
    #[error("empty payload")]
    EmptyData,

    /// The payload can never fit the file's maximum size.
    #[error("payload of {len} bytes exceeds the maximum file size {upper}")]
    TooBig {
        /// Payload length in bytes.
        len: u64,
        /// The geometry's upper size bound.
        upper: u64,
    },

    /// A truncate would shrink the file below its recovered tail.
    #[error("refusing to shrink the file")]
    Shrink,

    /// The path names a directory, not a file.
    #[error("path is a directory: {0}")]
    IsDirectory(String),

    /// Recovery could not locate a valid tail.
    #[error("file is corrupted: no valid tail marker")]
    Corrupted,

    /// EOF recovery was requested on a file that does not exist.
    #[error("EOF recovery on empty file")]
    EmptyFile,

    /// The file (or its manager) is closed.
    #[error("append-only file is closed")]
    Closed,

    /// The consumer or task requested a stop.
    #[error("stop requested")]
    Stop,

    /// The operation is recognised but intentionally not implemented.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A previous I/O failure; every later operation repeats it.
    #[error("sticky I/O failure: {0}")]
    Sticky(String),

    /// An I/O error from the filesystem layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The geometry failed validation.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

impl AofError {
    /// Transient errors are safe to retry without intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Full | Self::Timeout)
    }

    /// Terminal errors are sticky: every later operation on the same
    /// object fails the same way.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Stop | Self::Sticky(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_is_disjoint() {
        assert!(AofError::WouldBlock.is_transient());
        assert!(AofError::Full.is_transient());
        assert!(!AofError::WouldBlock.is_terminal());
        assert!(AofError::Closed.is_terminal());
        assert!(AofError::Sticky("disk".into()).is_terminal());
        assert!(!AofError::Corrupted.is_transient());
        assert!(!AofError::Corrupted.is_terminal());
    }
}
