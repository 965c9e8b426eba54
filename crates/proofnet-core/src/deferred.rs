//! Envelopes carried by the store-and-forward relay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{now_millis, NodeId};

/// A message queued for a recipient that is not currently reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredMessage {
    /// Identity used to de-duplicate copies held by several custodians.
    pub uuid: Uuid,
    pub recipient: NodeId,
    /// Creation time (Unix ms).
    pub timestamp: i64,
    /// Opaque content.
    pub content: Bytes,
}

impl DeferredMessage {
    /// A new message for `recipient`, stamped now.
    pub fn new(recipient: NodeId, content: impl Into<Bytes>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            recipient,
            timestamp: now_millis(),
            content: content.into(),
        }
    }
}

/// A request that statements of a context be countersigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub uuid: Uuid,
    /// Context the statements live in.
    pub context: Uuid,
    /// Statements to sign.
    pub statements: Vec<Uuid>,
    pub message: String,
    pub created_at: i64,
}

impl SignatureRequest {
    pub fn new(context: Uuid, statements: Vec<Uuid>, message: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            context,
            statements,
            message: message.into(),
            created_at: now_millis(),
        }
    }
}
