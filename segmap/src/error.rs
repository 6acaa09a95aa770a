use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the segmented map and its storage engine
#[derive(Error, Debug)]
pub enum SegmapError {
    /// IO errors when mapping, growing or flushing the backing file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The global header does not describe a map this build can open
    #[error("Format error: {0}")]
    Format(String),

    /// A segment failed structural verification or rebuild
    #[error("Segment {segment} is corrupt: {reason}")]
    CorruptSegment { segment: usize, reason: String },

    /// The segment has no free block or bump space large enough
    #[error("Segment {segment} capacity exceeded (requested {requested} bytes)")]
    CapacityExceeded { segment: usize, requested: usize },

    /// `try_lock` gave up before acquiring the segment lock
    #[error("Timed out after {waited:?} waiting for lock on segment {segment}")]
    LockTimeout { segment: usize, waited: Duration },

    /// `unlock` called by a thread that does not hold the lock
    #[error("Current thread does not own the lock on segment {segment}")]
    NotLockOwner { segment: usize },

    /// Encoding errors raised by a codec on the write side
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Decoding errors raised by a codec on the read side
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// A mutation was attempted from inside a traversal of the same segment
    #[error("Segment {segment} cannot be modified while it is being traversed")]
    TraversalInProgress { segment: usize },

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, SegmapError>;

impl SegmapError {
    pub(crate) fn corrupt(segment: usize, reason: impl Into<String>) -> Self {
        SegmapError::CorruptSegment {
            segment,
            reason: reason.into(),
        }
    }

    /// Returns true for errors a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SegmapError::LockTimeout { .. } | SegmapError::CapacityExceeded { .. }
        )
    }
}
