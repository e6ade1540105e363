//! Error types for BlockIO
//!
//! This module defines the common error types used throughout the system.

use crate::types::BlockId;
use std::fmt::Write as _;
use thiserror::Error;

/// Common result type for BlockIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BlockIO
#[derive(Debug, Error)]
pub enum Error {
    // Locality errors
    #[error("block {block_id} is not available on the local storage node")]
    BlockNotLocallyAvailable { block_id: BlockId },

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("block not found: {block_id}")]
    BlockNotFound { block_id: BlockId },

    #[error("block {block_id} is locked by {readers} reader(s)")]
    BlockLocked { block_id: BlockId, readers: usize },

    #[error("no lock held on block {block_id}")]
    LockNotHeld { block_id: BlockId },

    #[error("unexpected end of block {block_id} at offset {offset}: missing {expected} bytes")]
    UnexpectedEof {
        block_id: BlockId,
        offset: u64,
        expected: u64,
    },

    #[error("offset {offset} + length {length} exceeds block size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("stream is closed")]
    StreamClosed,

    // Network/RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// An error raised while cleaning up after `primary` failed
    #[error("{}", describe_suppressed(.primary, .suppressed))]
    WithSuppressed {
        #[source]
        primary: Box<Error>,
        suppressed: Vec<Error>,
    },
}

fn describe_suppressed(primary: &Error, suppressed: &[Error]) -> String {
    let mut msg = primary.to_string();
    for err in suppressed {
        let _ = write!(msg, " (suppressed: {err})");
    }
    msg
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Attach cleanup failures to this error
    ///
    /// The receiver stays the primary error. Attaching to an error that
    /// already carries suppressed errors extends its list.
    #[must_use]
    pub fn with_suppressed(self, mut errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            return self;
        }
        match self {
            Self::WithSuppressed {
                primary,
                mut suppressed,
            } => {
                suppressed.append(&mut errors);
                Self::WithSuppressed {
                    primary,
                    suppressed,
                }
            }
            other => Self::WithSuppressed {
                primary: Box::new(other),
                suppressed: errors,
            },
        }
    }

    /// The error that triggered the failure, ignoring attached cleanup errors
    #[must_use]
    pub fn primary(&self) -> &Self {
        match self {
            Self::WithSuppressed { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Cleanup errors attached to this error
    #[must_use]
    pub fn suppressed(&self) -> &[Error] {
        match self {
            Self::WithSuppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Check if the block must be read through a non-local path instead
    #[must_use]
    pub fn is_not_locally_available(&self) -> bool {
        matches!(self.primary(), Self::BlockNotLocallyAvailable { .. })
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.primary(), Self::ConnectionFailed(_))
    }

    /// Check if this is a local I/O failure
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(
            self.primary(),
            Self::DiskIo(_) | Self::Storage(_) | Self::UnexpectedEof { .. }
        )
    }

    fn io_kind(&self) -> std::io::ErrorKind {
        use std::io::ErrorKind;
        match self.primary() {
            Self::DiskIo(e) => e.kind(),
            Self::BlockNotLocallyAvailable { .. } | Self::BlockNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::UnexpectedEof { .. } => ErrorKind::UnexpectedEof,
            Self::OutOfBounds { .. } | Self::InvalidArgument(_) | Self::Configuration(_) => {
                ErrorKind::InvalidInput
            }
            Self::ConnectionFailed(_) => ErrorKind::ConnectionRefused,
            Self::BlockLocked { .. } => ErrorKind::ResourceBusy,
            Self::StreamClosed => ErrorKind::BrokenPipe,
            _ => ErrorKind::Other,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::DiskIo(e) => e,
            other => Self::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(!Error::StreamClosed.is_retryable());
    }

    #[test]
    fn test_not_locally_available() {
        let err = Error::BlockNotLocallyAvailable {
            block_id: BlockId::new(7),
        };
        assert!(err.is_not_locally_available());
        assert!(!err.is_io());
        assert_eq!(
            err.to_string(),
            "block 7 is not available on the local storage node"
        );
    }

    #[test]
    fn test_suppressed_keeps_primary() {
        let err = Error::storage("unlock failed")
            .with_suppressed(vec![Error::ConnectionFailed("gone".into())]);
        assert!(matches!(err.primary(), Error::Storage(_)));
        assert_eq!(err.suppressed().len(), 1);
        assert!(err.is_io());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "storage error: unlock failed (suppressed: connection failed: gone)"
        );
    }

    #[test]
    fn test_suppressed_extends_existing() {
        let err = Error::StreamClosed
            .with_suppressed(vec![Error::internal("a")])
            .with_suppressed(vec![Error::internal("b")]);
        assert!(matches!(err.primary(), Error::StreamClosed));
        assert_eq!(err.suppressed().len(), 2);
    }

    #[test]
    fn test_empty_suppressed_is_identity() {
        let err = Error::StreamClosed.with_suppressed(Vec::new());
        assert!(matches!(err, Error::StreamClosed));
    }

    #[test]
    fn test_into_io_error() {
        let io: std::io::Error = Error::UnexpectedEof {
            block_id: BlockId::new(1),
            offset: 10,
            expected: 5,
        }
        .into();
        assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);

        let io: std::io::Error =
            Error::DiskIo(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "x")).into();
        assert_eq!(io.kind(), std::io::ErrorKind::PermissionDenied);
    }
}
