//! Message bodies.
//!
//! Bodies are CBOR maps produced by serde. Decoders ignore map keys they do
//! not know, so a newer peer can add fields without breaking older ones.
//! Messages a peer cannot understand at all are gated by
//! [`WireMessage::REQUIRED_VERSION`].

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use proofnet_core::{
    DeferredMessage, NodeId, Person, SignatureRequest, Statement, StatementAuthority, Uuid,
};

use crate::deferred::DeferredOutcome;
use crate::error::{Result, SyncError};
use crate::lock::LockStatus;
use crate::phase::SubRootType;
use crate::resource::{Metadata, Resource, ResourcePayload};
use crate::salutation::Gender;
use crate::wire::codes::{MessageCode, MIN_PROTOCOL_VERSION};
use crate::wire::frame::Frame;

/// A message with a fixed code and a serde body.
pub trait WireMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CODE: MessageCode;
    const NAME: &'static str;
    /// Lowest peer protocol version that understands this message.
    const REQUIRED_VERSION: u16 = MIN_PROTOCOL_VERSION;

    fn to_frame(&self) -> Result<Frame> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(Frame::new(Self::CODE.to_u16(), body))
    }

    fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.code != Self::CODE.to_u16() {
            return Err(SyncError::UnexpectedMessage {
                expected: Self::NAME,
                got: frame.code,
            });
        }
        ciborium::from_reader(frame.body.as_ref()).map_err(|e| SyncError::Codec(e.to_string()))
    }
}

macro_rules! wire_message {
    ($ty:ident, $version:expr) => {
        impl WireMessage for $ty {
            const CODE: MessageCode = MessageCode::$ty;
            const NAME: &'static str = stringify!($ty);
            const REQUIRED_VERSION: u16 = $version;
        }
    };
    ($ty:ident) => {
        wire_message!($ty, MIN_PROTOCOL_VERSION);
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Bootstrap
// ─────────────────────────────────────────────────────────────────────────────

/// First message on every connection, sent by both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salutation {
    pub version: u16,
    pub gender: Gender,
    pub node: NodeId,
    /// The node the dialer meant to reach, if it knows.
    pub expected_peer: Option<NodeId>,
}

/// Ask the reached node to forward this connection to the expected peer,
/// replaying the original salutation frame to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splice {
    pub salutation: Bytes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Sub-root selection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRootRequest {
    pub kind: SubRootType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRootResponse {
    pub accepted: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Lock handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponse {
    pub status: LockStatus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Symmetric selection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub value: u16,
    pub resolver: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionAck {
    pub value: u16,
}

// ─────────────────────────────────────────────────────────────────────────────
// Resources
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAdvertise {
    pub entries: Vec<(Resource, Metadata)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub payloads: Vec<ResourcePayload>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Statement replication
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementOffer {
    pub uuids: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRequest {
    pub uuids: BTreeSet<Uuid>,
}

/// Requested statements in dependency order, with their authorities and
/// the persons who signed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementResponse {
    pub statements: Vec<Statement>,
    pub authorities: Vec<StatementAuthority>,
    pub persons: Vec<Person>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Deferred messaging
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredSend {
    pub message: DeferredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredResult {
    pub outcome: DeferredOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredBulkOffer {
    pub uuids: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredBulkRequest {
    pub uuids: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredBulkResponse {
    pub messages: Vec<DeferredMessage>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Signature requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequestOffer {
    pub request: SignatureRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequestResult {
    pub accepted: bool,
}

wire_message!(Salutation);
wire_message!(Splice);
wire_message!(SubRootRequest);
wire_message!(SubRootResponse);
wire_message!(LockInit);
wire_message!(LockRequest);
wire_message!(LockResponse);
wire_message!(SelectionRequest);
wire_message!(SelectionAck);
wire_message!(ResourceAdvertise);
wire_message!(ResourceRequest);
wire_message!(ResourceResponse);
wire_message!(StatementOffer);
wire_message!(StatementRequest);
wire_message!(StatementResponse);
wire_message!(DeferredSend);
wire_message!(DeferredResult);
wire_message!(DeferredBulkOffer, 2);
wire_message!(DeferredBulkRequest, 2);
wire_message!(DeferredBulkResponse, 2);
wire_message!(SignatureRequestOffer, 2);
wire_message!(SignatureRequestResult, 2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mismatch_is_unexpected() {
        let frame = LockInit.to_frame().unwrap();
        assert!(matches!(
            LockRequest::from_frame(&frame),
            Err(SyncError::UnexpectedMessage { expected: "LockRequest", .. })
        ));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        #[derive(Serialize)]
        struct NewerAck {
            value: u16,
            extra: String,
        }
        let mut body = Vec::new();
        ciborium::into_writer(&NewerAck { value: 3, extra: "future".into() }, &mut body).unwrap();
        let frame = Frame::new(MessageCode::SelectionAck.to_u16(), body);
        assert_eq!(SelectionAck::from_frame(&frame).unwrap(), SelectionAck { value: 3 });
    }

    #[test]
    fn test_salutation_frame() {
        let salutation = Salutation {
            version: 2,
            gender: Gender::Male,
            node: NodeId::from_bytes([1; 16]),
            expected_peer: None,
        };
        let frame = salutation.to_frame().unwrap();
        assert_eq!(frame.code, MessageCode::Salutation.to_u16());
        assert_eq!(Salutation::from_frame(&frame).unwrap(), salutation);
    }
}
