//! Error types for proofnet Core.

use thiserror::Error;
use uuid::Uuid;

/// Core errors from cryptographic and encoding operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for entities received from a peer.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("signature verification failed for {entity} {uuid}")]
    SignatureFailed { entity: &'static str, uuid: Uuid },

    #[error("signer {0} is unknown")]
    UnknownSigner(Uuid),

    #[error("public key of person {0} does not match the known key")]
    PublicKeyMismatch(Uuid),

    #[error("statement {0} depends on itself")]
    SelfDependency(Uuid),

    #[error("statement {0} is missing its context")]
    MissingContext(Uuid),

    #[error("root context {0} cannot live inside a context")]
    NestedRootContext(Uuid),

    #[error("statement {statement} references {missing}, which is not available")]
    MissingDependency { statement: Uuid, missing: Uuid },

    #[error("authority does not belong to statement {0}")]
    AuthorityMismatch(Uuid),

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        ValidationError::StructuralError(e.to_string())
    }
}
