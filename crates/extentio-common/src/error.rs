//! Error types for ExtentIO
//!
//! One taxonomy shared by every crate in the engine. The variants map to
//! the recovery policies the RAID group applies: timeouts and media errors
//! are retryable, policy rejections carry a qualifier the client can act
//! on, fatal errors force the group to `Failed`.

use crate::types::{ObjectId, Position};
use thiserror::Error;

/// Common result type for ExtentIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Qualifier attached to a block-operation status so clients can tell a
/// deliberate rejection from a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    /// Degraded parity group refused a sub-stripe write (client opted in)
    NotFullStripe,
    /// I/O arrived on the SP without a live path to a member (client opted in)
    NotPreferred,
    /// The group is failed; retrying on either SP cannot succeed
    RetryNotPossible,
}

/// Common error type for ExtentIO
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("invalid metadata offset {offset}: must be a multiple of {record_size}")]
    InvalidOffset { offset: u64, record_size: u64 },

    #[error("media error at position {position} lba {lba}")]
    Media { position: Position, lba: u64 },

    #[error("drive removed at position {0}")]
    DriveRemoved(Position),

    #[error("I/O rejected by policy: {0:?}")]
    PolicyRejected(Qualifier),

    #[error("raid group failed: {0}")]
    Fatal(String),

    #[error("journal has no free slots")]
    JournalFull,

    #[error("peer SP unreachable")]
    PeerUnreachable,

    #[error("group is quiesced")]
    Quiesced,

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Check if this error is retryable by the caller
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Media { .. } | Self::JournalFull | Self::Quiesced
        )
    }

    /// Check if this is a deliberate policy rejection (not a failure)
    #[must_use]
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            Self::PolicyRejected(Qualifier::NotFullStripe | Qualifier::NotPreferred)
        )
    }

    /// Check if this error forces the group to re-evaluate shutdown
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Qualifier carried by this error, if any
    #[must_use]
    pub fn qualifier(&self) -> Option<Qualifier> {
        match self {
            Self::PolicyRejected(q) => Some(*q),
            Self::Fatal(_) => Some(Qualifier::RetryNotPossible),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout("rebuild".into()).is_retryable());
        assert!(Error::Media {
            position: 1,
            lba: 0x100
        }
        .is_retryable());
        assert!(!Error::Fatal("two positions lost".into()).is_retryable());
    }

    #[test]
    fn test_policy_rejection_distinguishable_from_fatal() {
        let rejected = Error::PolicyRejected(Qualifier::NotFullStripe);
        assert!(rejected.is_policy_rejection());
        assert!(!rejected.is_fatal());
        assert_eq!(rejected.qualifier(), Some(Qualifier::NotFullStripe));

        let fatal = Error::fatal("reconstruction impossible");
        assert!(!fatal.is_policy_rejection());
        assert_eq!(fatal.qualifier(), Some(Qualifier::RetryNotPossible));
    }
}
