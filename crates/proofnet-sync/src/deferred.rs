//! Store-and-forward delivery of deferred messages.
//!
//! A message is addressed to a node uuid, not to an address. The receiving
//! peer asks its [`ClosestNode`] collaborator which known node is closest
//! to the recipient:
//!
//! - no address: the peer itself is closest and takes custody
//! - an address with an unspecified IP: redirect to the port on the host the
//!   sender already reached
//! - a full address: redirect there
//!
//! Custodians synchronize their queues with every connected peer in a bulk
//! dialog, and drop a message once its recipient holds it.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use proofnet_core::{DeferredMessage, NodeId, Uuid};
use proofnet_store::{Change, Store, Transaction};

use crate::context::SyncContext;
use crate::dialog::Dialog;
use crate::error::{Result, SyncError};
use crate::wire::{
    DeferredBulkOffer, DeferredBulkRequest, DeferredBulkResponse, DeferredResult, DeferredSend,
};

/// A node and, if it is not reached through the current peer, where to
/// find it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub node: NodeId,
    /// `None` means "through the current peer".
    pub address: Option<SocketAddr>,
}

/// Routing knowledge: the known node closest to a target.
#[async_trait]
pub trait ClosestNode: Send + Sync {
    async fn closest(&self, target: &NodeId) -> NodeAddress;
}

/// Routes that know no other node: this node keeps everything.
#[derive(Debug, Clone)]
pub struct LocalCustody {
    node: NodeId,
}

impl LocalCustody {
    pub fn new(node: NodeId) -> Self {
        Self { node }
    }
}

#[async_trait]
impl ClosestNode for LocalCustody {
    async fn closest(&self, _target: &NodeId) -> NodeAddress {
        NodeAddress {
            node: self.node,
            address: None,
        }
    }
}

/// Routes to directly known nodes; custody for everything else.
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    routes: RwLock<HashMap<NodeId, SocketAddr>>,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Record where `node` listens. An unspecified IP means "the host you
    /// are already talking to".
    pub fn insert(&self, node: NodeId, address: SocketAddr) {
        self.routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(node, address);
    }

    pub fn remove(&self, node: &NodeId) {
        self.routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(node);
    }

    pub fn get(&self, node: &NodeId) -> Option<SocketAddr> {
        self.routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(node)
            .copied()
    }
}

#[async_trait]
impl ClosestNode for RoutingTable {
    async fn closest(&self, target: &NodeId) -> NodeAddress {
        match self.get(target) {
            Some(address) if *target != self.local => NodeAddress {
                node: *target,
                address: Some(address),
            },
            _ => NodeAddress {
                node: self.local,
                address: None,
            },
        }
    }
}

/// Answer to a [`DeferredSend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferredOutcome {
    /// The responder took custody.
    Accepted,
    /// Deliver to `node` at `address` instead.
    AddressRedirect { node: NodeId, address: SocketAddr },
    /// Deliver to `node` at `port` on the host already reached.
    PortRedirect { node: NodeId, port: u16 },
}

impl DeferredOutcome {
    /// Where a redirect points, resolved against the address the sender
    /// used for the current connection.
    pub fn redirect_target(&self, current: Option<SocketAddr>) -> Option<NodeAddress> {
        match *self {
            DeferredOutcome::Accepted => None,
            DeferredOutcome::AddressRedirect { node, address } => Some(NodeAddress {
                node,
                address: Some(address),
            }),
            DeferredOutcome::PortRedirect { node, port } => Some(NodeAddress {
                node,
                address: current.map(|c| SocketAddr::new(c.ip(), port)),
            }),
        }
    }
}

/// Decide what to do with a message for `recipient`.
pub async fn route(ctx: &SyncContext, recipient: &NodeId) -> DeferredOutcome {
    let closest = ctx.routes().closest(recipient).await;
    match closest.address {
        None => DeferredOutcome::Accepted,
        Some(address) if address.ip().is_unspecified() => DeferredOutcome::PortRedirect {
            node: closest.node,
            port: address.port(),
        },
        Some(address) => DeferredOutcome::AddressRedirect {
            node: closest.node,
            address,
        },
    }
}

/// Sender side of a single delivery.
pub async fn send_deferred(dialog: &mut Dialog<'_>, message: &DeferredMessage) -> Result<DeferredOutcome> {
    dialog.send(&DeferredSend {
        message: message.clone(),
    })?;
    let outcome = dialog.recv::<DeferredResult>().await?.outcome;
    tracing::debug!(
        conn = %dialog.connection_id(),
        message = %message.uuid,
        recipient = %message.recipient,
        ?outcome,
        "deferred message sent"
    );
    Ok(outcome)
}

/// Responder side of a single delivery. Stages the message when taking
/// custody.
pub async fn receive_deferred(
    ctx: &SyncContext,
    dialog: &mut Dialog<'_>,
    txn: &mut Transaction,
) -> Result<(DeferredMessage, DeferredOutcome)> {
    let message = dialog.recv::<DeferredSend>().await?.message;
    let outcome = route(ctx, &message.recipient).await;
    if outcome == DeferredOutcome::Accepted {
        let held = ctx.store().deferred_messages(txn).await?;
        if !held.iter().any(|m| m.uuid == message.uuid) {
            txn.stage(Change::PutDeferredMessage(message.clone()));
        }
        if message.recipient == ctx.node() {
            tracing::info!(message = %message.uuid, "deferred message delivered");
        }
    } else {
        tracing::debug!(message = %message.uuid, ?outcome, "redirecting deferred message");
    }
    dialog.send(&DeferredResult { outcome })?;
    Ok((message, outcome))
}

/// Result of [`sync_deferred`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub sent: usize,
    pub received: usize,
    /// Messages handed to their recipient and dropped locally.
    pub delivered: usize,
}

/// Bulk custody synchronization with the peer. Symmetric.
///
/// Each side offers what it holds except messages addressed to itself,
/// requests what it lacks from the peer's offer, and drops messages
/// addressed to the peer once the exchange has gone through.
pub async fn sync_deferred(
    dialog: &mut Dialog<'_>,
    store: &dyn Store,
    txn: &mut Transaction,
    local: NodeId,
    peer: NodeId,
) -> Result<BulkOutcome> {
    let held = store.deferred_messages(txn).await?;
    let held_uuids: BTreeSet<Uuid> = held.iter().map(|m| m.uuid).collect();
    let offer: BTreeSet<Uuid> = held
        .iter()
        .filter(|m| m.recipient != local)
        .map(|m| m.uuid)
        .collect();
    dialog.send(&DeferredBulkOffer {
        uuids: offer.clone(),
    })?;

    let theirs = dialog.recv::<DeferredBulkOffer>().await?.uuids;
    let missing: BTreeSet<Uuid> = theirs.difference(&held_uuids).copied().collect();
    dialog.send(&DeferredBulkRequest {
        uuids: missing.clone(),
    })?;

    let request = dialog.recv::<DeferredBulkRequest>().await?.uuids;
    if let Some(stray) = request.iter().find(|u| !offer.contains(u)) {
        return Err(SyncError::InvalidMessage(format!(
            "peer requested deferred message {stray} which was not offered"
        )));
    }
    let messages: Vec<DeferredMessage> = held
        .iter()
        .filter(|m| request.contains(&m.uuid))
        .cloned()
        .collect();
    let sent = messages.len();
    dialog.send(&DeferredBulkResponse { messages })?;

    let response = dialog.recv::<DeferredBulkResponse>().await?.messages;
    let mut received = 0;
    for message in response {
        if !missing.contains(&message.uuid) {
            return Err(SyncError::InvalidMessage(format!(
                "unrequested deferred message {}",
                message.uuid
            )));
        }
        txn.stage(Change::PutDeferredMessage(message));
        received += 1;
    }

    let mut delivered = 0;
    for message in held.iter().filter(|m| m.recipient == peer) {
        txn.stage(Change::RemoveDeferredMessage(message.uuid));
        delivered += 1;
    }

    tracing::debug!(conn = %dialog.connection_id(), sent, received, delivered, "deferred custody synced");
    Ok(BulkOutcome {
        sent,
        received,
        delivered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use proofnet_store::MemoryStore;

    use crate::connection::{pipe, ConnectionId};
    use crate::context::SyncConfig;
    use crate::wire::PROTOCOL_VERSION;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 16])
    }

    fn responder(routes: RoutingTable) -> SyncContext {
        SyncContext::new(node(2), Arc::new(MemoryStore::new()), SyncConfig::default())
            .with_routes(Arc::new(routes))
    }

    async fn deliver(ctx: &SyncContext, message: &DeferredMessage) -> DeferredOutcome {
        let (mut a, mut b) = pipe(ConnectionId(1), ConnectionId(2), 1 << 20);
        let budget = Duration::from_secs(5);
        let mut txn = ctx.store().begin(Some(2)).await.unwrap();
        let (sent, received) = tokio::join!(
            async {
                let mut d = Dialog::open(&mut a, budget, PROTOCOL_VERSION).unwrap();
                let outcome = send_deferred(&mut d, message).await.unwrap();
                d.close().await.unwrap();
                outcome
            },
            async {
                let mut d = Dialog::open(&mut b, budget, PROTOCOL_VERSION).unwrap();
                let got = receive_deferred(ctx, &mut d, &mut txn).await.unwrap();
                d.close().await.unwrap();
                got
            }
        );
        ctx.store().commit(txn).await.unwrap();
        assert_eq!(received.0, *message);
        assert_eq!(sent, received.1);
        sent
    }

    #[tokio::test]
    async fn test_custody_when_peer_is_closest() {
        let ctx = responder(RoutingTable::new(node(2)));
        let message = DeferredMessage::new(node(9), b"hello".to_vec());
        assert_eq!(deliver(&ctx, &message).await, DeferredOutcome::Accepted);

        let txn = ctx.store().begin(None).await.unwrap();
        let held = ctx.store().deferred_messages_for(&txn, &node(9)).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].recipient, node(9));
        assert_eq!(held[0].timestamp, message.timestamp);
    }

    #[tokio::test]
    async fn test_redirects_to_known_node() {
        let routes = RoutingTable::new(node(2));
        let full: SocketAddr = "10.0.0.7:7400".parse().unwrap();
        let port_only: SocketAddr = "0.0.0.0:7401".parse().unwrap();
        routes.insert(node(7), full);
        routes.insert(node(8), port_only);
        let ctx = responder(routes);

        let to_seven = DeferredMessage::new(node(7), b"a".to_vec());
        assert_eq!(
            deliver(&ctx, &to_seven).await,
            DeferredOutcome::AddressRedirect {
                node: node(7),
                address: full
            }
        );
        let to_eight = DeferredMessage::new(node(8), b"b".to_vec());
        let outcome = deliver(&ctx, &to_eight).await;
        assert_eq!(outcome, DeferredOutcome::PortRedirect { node: node(8), port: 7401 });

        let current: SocketAddr = "192.168.1.5:7000".parse().unwrap();
        assert_eq!(
            outcome.redirect_target(Some(current)).unwrap().address,
            Some("192.168.1.5:7401".parse().unwrap())
        );

        let txn = ctx.store().begin(None).await.unwrap();
        assert!(ctx.store().deferred_messages(&txn).await.unwrap().is_empty());
    }

    async fn hold(store: &MemoryStore, messages: &[DeferredMessage]) {
        let mut txn = store.begin(None).await.unwrap();
        for m in messages {
            txn.stage(Change::PutDeferredMessage(m.clone()));
        }
        store.commit(txn).await.unwrap();
    }

    #[tokio::test]
    async fn test_bulk_sync_moves_custody_and_delivers() {
        let (a, b) = (MemoryStore::new(), MemoryStore::new());
        let for_b = DeferredMessage::new(node(2), b"for b".to_vec());
        let for_c = DeferredMessage::new(node(3), b"for c".to_vec());
        let for_a = DeferredMessage::new(node(1), b"for a".to_vec());
        hold(&a, &[for_b.clone(), for_c.clone(), for_a.clone()]).await;

        let (mut ca, mut cb) = pipe(ConnectionId(1), ConnectionId(2), 1 << 20);
        let budget = Duration::from_secs(5);
        let (ra, rb) = tokio::join!(
            async {
                let mut txn = a.begin(Some(1)).await.unwrap();
                let mut d = Dialog::open(&mut ca, budget, PROTOCOL_VERSION).unwrap();
                let out = sync_deferred(&mut d, &a, &mut txn, node(1), node(2)).await.unwrap();
                d.close().await.unwrap();
                a.commit(txn).await.unwrap();
                out
            },
            async {
                let mut txn = b.begin(Some(2)).await.unwrap();
                let mut d = Dialog::open(&mut cb, budget, PROTOCOL_VERSION).unwrap();
                let out = sync_deferred(&mut d, &b, &mut txn, node(2), node(1)).await.unwrap();
                d.close().await.unwrap();
                b.commit(txn).await.unwrap();
                out
            }
        );
        assert_eq!(ra, BulkOutcome { sent: 2, received: 0, delivered: 1 });
        assert_eq!(rb.received, 2);

        let ta = a.begin(None).await.unwrap();
        let left_on_a: BTreeSet<Uuid> =
            a.deferred_messages(&ta).await.unwrap().iter().map(|m| m.uuid).collect();
        assert_eq!(left_on_a, BTreeSet::from([for_c.uuid, for_a.uuid]));

        let tb = b.begin(None).await.unwrap();
        assert_eq!(b.deferred_messages_for(&tb, &node(2)).await.unwrap(), vec![for_b]);
        assert_eq!(b.deferred_messages_for(&tb, &node(3)).await.unwrap().len(), 1);
    }
}
