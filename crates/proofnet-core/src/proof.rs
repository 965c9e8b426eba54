//! Statement proofs.
//!
//! A proof is an opaque payload produced by the term kernel together with
//! the statements it refers to. A node integrates a proof only once every
//! referenced statement exists locally.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The proof of one statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementProof {
    /// The statement being proven.
    pub statement: Uuid,
    /// Statements the proof refers to.
    pub dependencies: Vec<Uuid>,
    /// Opaque proof encoding.
    pub payload: Bytes,
}

impl StatementProof {
    pub fn new(statement: Uuid, dependencies: Vec<Uuid>, payload: impl Into<Bytes>) -> Self {
        Self {
            statement,
            dependencies,
            payload: payload.into(),
        }
    }
}
