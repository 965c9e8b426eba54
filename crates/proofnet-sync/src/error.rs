//! Error types for the sync module.

use thiserror::Error;

use proofnet_core::{NodeId, ValidationError};
use proofnet_store::StoreError;

/// How a failure affects the connection and the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The peer broke the protocol. Fatal to the connection, never retried.
    Protocol,
    /// I/O failure or an exhausted time budget. The connection is torn down,
    /// the node keeps running.
    Stream,
    /// The local store failed.
    Store,
    /// A local invariant was violated.
    Internal,
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u16, peer: u16 },

    /// The peer presented our own node identity.
    #[error("peer claims the local node identity {0}")]
    SelfConnection(NodeId),

    /// Both ends resolved the same connection role.
    #[error("both ends of the connection claim the same role")]
    EqualGenders,

    /// The peer's identity does not match the one we dialed, and splicing
    /// was not possible.
    #[error("expected peer {expected}, reached {actual}")]
    PeerMismatch { expected: NodeId, actual: NodeId },

    /// A frame with a different code than the protocol state expects.
    #[error("unexpected message: expected {expected}, got code {got}")]
    UnexpectedMessage { expected: &'static str, got: u16 },

    /// A message the peer's protocol version cannot understand.
    #[error("{message} requires protocol version {required}, peer speaks {peer}")]
    UnsupportedByPeer {
        message: &'static str,
        required: u16,
        peer: u16,
    },

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Body decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Entity validation failed (signatures, structure).
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Transport-level error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Local invariant violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::VersionMismatch { .. }
            | SyncError::SelfConnection(_)
            | SyncError::EqualGenders
            | SyncError::PeerMismatch { .. }
            | SyncError::UnexpectedMessage { .. }
            | SyncError::UnsupportedByPeer { .. }
            | SyncError::InvalidMessage(_)
            | SyncError::Codec(_)
            | SyncError::FrameTooLarge { .. }
            | SyncError::Validation(_) => ErrorClass::Protocol,
            SyncError::Io(_) | SyncError::ConnectionClosed | SyncError::Timeout(_) => {
                ErrorClass::Stream
            }
            SyncError::Store(_) => ErrorClass::Store,
            SyncError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether this is a stream-level fault (I/O or timeout).
    pub fn is_stream(&self) -> bool {
        self.class() == ErrorClass::Stream
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(SyncError::EqualGenders.class(), ErrorClass::Protocol);
        assert_eq!(SyncError::ConnectionClosed.class(), ErrorClass::Stream);
        assert_eq!(SyncError::Timeout("x".into()).class(), ErrorClass::Stream);
        assert_eq!(SyncError::Store(StoreError::Poisoned).class(), ErrorClass::Store);
        assert!(SyncError::Validation(ValidationError::UnknownSigner(Default::default()))
            .class()
            == ErrorClass::Protocol);
    }
}
