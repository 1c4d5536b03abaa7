//! Error types for the capture pipeline.
//!
//! One enum covers every failure mode of the worker, from bad wire messages
//! to storage faults. The split that matters operationally is fatal versus
//! recoverable: a malformed message is dropped and the loop keeps running,
//! while geometry drift and storage I/O terminate the run after a
//! best-effort flush. [`SaverError::is_fatal`] encodes that policy.

use crate::codec::FrameGeometry;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, SaverError>;

/// Errors that can occur while capturing a movie to disk.
#[derive(Error, Debug)]
pub enum SaverError {
    /// Wire message with missing/invalid metadata or a payload whose length
    /// does not match the declared shape. Dropped by the loop, never fatal.
    #[error("malformed frame message: {reason}")]
    MalformedFrame { reason: String },

    /// Frame shape or element type changed mid-run. The store geometry is
    /// fixed by the first admitted frame for the lifetime of the file.
    #[error("frame geometry changed mid-run: expected {expected}, got {actual}")]
    GeometryMismatch {
        expected: FrameGeometry,
        actual: FrameGeometry,
    },

    /// Write attempted on a full staging buffer. The capture loop always
    /// flushes before writing, so this indicates a logic bug, not a runtime
    /// condition callers should handle.
    #[error("staging buffer full ({capacity} frames); flush required before write")]
    BufferFull { capacity: usize },

    /// Storage I/O failure (disk full, permissions, truncation failure).
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A store file that fails header or length validation on open.
    #[error("corrupt store file: {message}")]
    CorruptStore { message: String },

    /// Invalid configuration or parameter.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The producer side of the frame source is gone. The capture loop
    /// treats this as a stop trigger; other callers see it as an error.
    #[error("frame source disconnected")]
    SourceDisconnected,

    /// The capture thread panicked before producing a report.
    #[error("capture worker panicked")]
    WorkerPanicked,
}

impl SaverError {
    /// Whether this error terminates the capture loop.
    ///
    /// Non-fatal errors are recovered locally (the offending message is
    /// dropped). Fatal errors end the run after a best-effort flush of
    /// already-staged frames.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MalformedFrame { .. })
    }

    /// Check if this is a malformed-message error.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedFrame { .. })
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptStore {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(!SaverError::malformed("truncated payload").is_fatal());
        assert!(SaverError::BufferFull { capacity: 16 }.is_fatal());
        assert!(SaverError::SourceDisconnected.is_fatal());
        assert!(SaverError::from(std::io::Error::other("disk full")).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SaverError::BufferFull { capacity: 128 };
        assert!(err.to_string().contains("128"));
    }
}
