//! Error types for the store module.

use proofnet_core::Uuid;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A statement with this uuid already exists with different content.
    /// Statements are immutable once stored.
    #[error("statement {0} already exists with different content")]
    Conflict(Uuid),

    /// Invalid data in storage or in a staged change.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A lock guarding the store was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
