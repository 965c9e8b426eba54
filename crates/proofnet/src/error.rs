//! Error types for the node.

use proofnet_core::ValidationError;
use proofnet_store::StoreError;
use proofnet_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A statement referenced by an operation is not held locally.
    #[error("statement not found: {0}")]
    StatementNotFound(String),

    /// The task driving a connection panicked or was cancelled.
    #[error("connection task failed: {0}")]
    Task(String),

    /// A session ended differently from what the operation asked for.
    #[error("unexpected session outcome: {0}")]
    UnexpectedOutcome(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
