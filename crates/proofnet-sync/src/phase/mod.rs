//! The phase tree of a connection.
//!
//! ```text
//!   salutation
//!     └── RootPhase: sub-root selection
//!           ├── Statement
//!           │     ├── initial sub-phase (one pass)
//!           │     └── loop sub-phase (select, run, repeat until valediction)
//!           ├── DeferredMessage (one delivery)
//!           └── SignatureRequest (one request)
//! ```
//!
//! A phase borrows the connection from its parent and ends before the
//! parent does. [`run_session`] drives a connection from salutation to the
//! end of its sub-root.

mod loop_dialog;
mod root;
mod statement;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use proofnet_core::{DeferredMessage, NodeId, SignatureRequest};
use proofnet_store::Change;

use crate::connection::Connection;
use crate::context::SyncContext;
use crate::deferred::{DeferredOutcome, NodeAddress};
use crate::error::{Result, SyncError};
use crate::salutation::{salute, Gender, Saluted};
use crate::subscription::ConnectionState;
use crate::transport::Transport;

pub use loop_dialog::LoopDialogType;
pub use root::RootPhase;
pub use statement::{ConnectionReport, StatementPhase};

/// Activity a connection is used for, chosen once after salutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubRootType {
    /// Long-lived statement synchronization.
    Statement,
    /// Hand over one deferred message.
    DeferredMessage,
    /// Deliver one signature request.
    SignatureRequest,
}

impl SubRootType {
    pub const ALL: [SubRootType; 3] = [
        SubRootType::Statement,
        SubRootType::DeferredMessage,
        SubRootType::SignatureRequest,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            SubRootType::Statement => "Statement",
            SubRootType::DeferredMessage => "DeferredMessage",
            SubRootType::SignatureRequest => "SignatureRequest",
        }
    }

    pub const fn required_version(self) -> u16 {
        match self {
            SubRootType::SignatureRequest => 2,
            _ => 1,
        }
    }
}

/// What a dialer wants from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIntent {
    Statement,
    Deferred(DeferredMessage),
    SignatureRequest(SignatureRequest),
}

impl SessionIntent {
    pub fn kind(&self) -> SubRootType {
        match self {
            SessionIntent::Statement => SubRootType::Statement,
            SessionIntent::Deferred(_) => SubRootType::DeferredMessage,
            SessionIntent::SignatureRequest(_) => SubRootType::SignatureRequest,
        }
    }
}

/// Which end of the connection this node is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Dialer {
        expected: Option<NodeId>,
        intent: SessionIntent,
    },
    Acceptor,
}

impl Endpoint {
    pub fn gender(&self) -> Gender {
        match self {
            Endpoint::Dialer { .. } => Gender::Male,
            Endpoint::Acceptor => Gender::Female,
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Statement(ConnectionReport),
    Deferred {
        message: DeferredMessage,
        outcome: DeferredOutcome,
    },
    SignatureRequest {
        request: SignatureRequest,
        accepted: bool,
    },
    /// The responder declined the sub-root.
    Refused(SubRootType),
    /// The connection was handed on to another node.
    Spliced { target: NodeId },
}

/// Drive a connection from salutation to the end of its sub-root.
///
/// `state` is used by a statement sub-root; callers keep a clone to watch
/// progress and to request valediction.
pub async fn run_session(
    ctx: &SyncContext,
    conn: Connection,
    endpoint: Endpoint,
    state: Arc<ConnectionState>,
) -> Result<SessionOutcome> {
    let conn_id = conn.id();
    let expected = match &endpoint {
        Endpoint::Dialer { expected, .. } => *expected,
        Endpoint::Acceptor => None,
    };
    let (mut conn, peer) = match salute(ctx, conn, endpoint.gender(), expected).await? {
        Saluted::Established { conn, peer } => (conn, peer),
        Saluted::Spliced { target } => return Ok(SessionOutcome::Spliced { target }),
    };
    state.set_peer_version(peer.version);
    tracing::info!(
        conn = %conn_id,
        peer = %peer.node,
        version = peer.version,
        gender = ?peer.gender,
        "connection established"
    );

    let intent = match endpoint {
        Endpoint::Dialer { intent, .. } => Some(intent),
        Endpoint::Acceptor => None,
    };
    let outcome = RootPhase::new(ctx, &mut conn, peer).run(intent, &state).await;
    match &outcome {
        Ok(_) => tracing::info!(conn = %conn_id, peer = %peer.node, "connection finished"),
        Err(e) => tracing::warn!(conn = %conn_id, peer = %peer.node, error = %e, "connection failed"),
    }
    outcome
}

/// Deliver `message`, starting at `first` and following redirects.
///
/// Returns the node that took custody. When no hop takes it (a hop is
/// unreachable or fails, or the redirect limit is reached) the message is
/// kept in the local store and the local node is returned.
pub async fn deliver_deferred(
    ctx: &SyncContext,
    transport: &dyn Transport,
    first: NodeAddress,
    message: DeferredMessage,
) -> Result<NodeId> {
    match follow_redirects(ctx, transport, first, &message).await {
        Ok(Some(custodian)) => Ok(custodian),
        Ok(None) => keep_custody(ctx, message).await,
        Err(e) => {
            tracing::warn!(message = %message.uuid, error = %e, "delivery failed, keeping custody");
            keep_custody(ctx, message).await
        }
    }
}

/// `None` when the chain of hops ends without a custodian.
async fn follow_redirects(
    ctx: &SyncContext,
    transport: &dyn Transport,
    first: NodeAddress,
    message: &DeferredMessage,
) -> Result<Option<NodeId>> {
    let mut hop = first;
    let mut redirects = 0;
    loop {
        let Some(address) = hop.address else {
            tracing::debug!(message = %message.uuid, node = %hop.node, "no address for hop");
            return Ok(None);
        };
        let stream = transport.connect(address).await?;
        let conn = ctx.connection(stream, Some(address));
        let state = Arc::new(ConnectionState::new(conn.id()));
        let endpoint = Endpoint::Dialer {
            expected: Some(hop.node),
            intent: SessionIntent::Deferred(message.clone()),
        };
        let outcome = match run_session(ctx, conn, endpoint, state).await? {
            SessionOutcome::Deferred { outcome, .. } => outcome,
            SessionOutcome::Refused(kind) => {
                return Err(SyncError::InvalidMessage(format!("{} refused {}", hop.node, kind.name())))
            }
            other => return Err(SyncError::Internal(format!("unexpected session outcome {other:?}"))),
        };
        let Some(next) = outcome.redirect_target(Some(address)) else {
            return Ok(Some(hop.node));
        };
        if redirects == ctx.config().max_redirects {
            tracing::debug!(message = %message.uuid, redirects, "redirect limit reached");
            return Ok(None);
        }
        redirects += 1;
        tracing::debug!(message = %message.uuid, from = %hop.node, to = %next.node, "following redirect");
        hop = next;
    }
}

async fn keep_custody(ctx: &SyncContext, message: DeferredMessage) -> Result<NodeId> {
    tracing::debug!(message = %message.uuid, recipient = %message.recipient, "keeping custody");
    let store = ctx.store();
    let mut txn = store.begin(None).await?;
    txn.stage(Change::PutDeferredMessage(message));
    store.commit(txn).await?;
    Ok(ctx.node())
}
