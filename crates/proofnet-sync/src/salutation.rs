//! Salutation: the first exchange on every connection.
//!
//! Both ends send their protocol version, connection role (gender) and node
//! identity, then check the peer's. The dialer is always [`Gender::Male`].
//!
//! A dialer that expects a particular node embeds its identity. If another
//! node answers (typically a gateway in front of a NAT), the dialer asks it
//! to splice the connection through to the expected node, replaying the
//! original salutation frame, and then salutes again with whoever answers
//! through the splice.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use proofnet_core::NodeId;

use crate::connection::Connection;
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::wire::{Salutation, Splice, WireMessage, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// Connection role. Assigned per connection; the two ends always differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    /// The dialing end. Requests sub-roots and initiates the lock handshake.
    Male,
    /// The accepting end.
    Female,
}

impl Gender {
    pub fn opposite(self) -> Self {
        match self {
            Gender::Male => Gender::Female,
            Gender::Female => Gender::Male,
        }
    }

    /// Whether this role drives the distributed lock handshake.
    pub fn is_lock_initiator(self) -> bool {
        self == Gender::Male
    }
}

/// What salutation learned about the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub node: NodeId,
    /// Negotiated version: the lower of both ends.
    pub version: u16,
    /// Local role on this connection.
    pub gender: Gender,
}

/// Result of [`salute`].
#[derive(Debug)]
pub enum Saluted {
    Established { conn: Connection, peer: PeerInfo },
    /// The connection was handed to the splicer and is no longer ours.
    Spliced { target: NodeId },
}

/// Forwards a connection to another node.
#[async_trait]
pub trait Splicer: Send + Sync {
    /// Connect to `target`, write `salutation` to it verbatim, then shuttle
    /// bytes between `conn` and the new stream until either side closes.
    async fn splice(&self, target: NodeId, salutation: Bytes, conn: Connection) -> Result<()>;
}

/// Run the salutation exchange.
pub async fn salute(
    ctx: &SyncContext,
    mut conn: Connection,
    gender: Gender,
    expected: Option<NodeId>,
) -> Result<Saluted> {
    let budget = ctx.config().dialog_budget();
    let mine = Salutation {
        version: PROTOCOL_VERSION,
        gender,
        node: ctx.node(),
        expected_peer: expected,
    };
    let my_frame = mine.to_frame()?;
    conn.write_frame(&my_frame).await?;

    let theirs: Salutation = read_within(&mut conn, budget).await?;
    let peer = check(ctx.node(), gender, &theirs)?;

    // Responder side: the dialer wanted somebody else.
    if let Some(wanted) = theirs.expected_peer {
        if wanted != ctx.node() {
            let splice: Splice = read_within(&mut conn, budget).await?;
            let Some(splicer) = ctx.splicer() else {
                return Err(SyncError::PeerMismatch {
                    expected: wanted,
                    actual: ctx.node(),
                });
            };
            tracing::info!(conn = %conn.id(), target = %wanted, "splicing connection");
            splicer.splice(wanted, splice.salutation, conn).await?;
            return Ok(Saluted::Spliced { target: wanted });
        }
    }

    // Dialer side: somebody else answered.
    if let Some(wanted) = expected {
        if peer.node != wanted {
            tracing::info!(
                conn = %conn.id(),
                expected = %wanted,
                reached = %peer.node,
                "peer mismatch, requesting splice"
            );
            conn.write_frame(&Splice { salutation: my_frame.encode()? }.to_frame()?)
                .await?;
            let replayed: Salutation = read_within(&mut conn, budget).await?;
            let peer = check(ctx.node(), gender, &replayed)?;
            if peer.node != wanted {
                return Err(SyncError::PeerMismatch {
                    expected: wanted,
                    actual: peer.node,
                });
            }
            return Ok(Saluted::Established { conn, peer });
        }
    }

    tracing::debug!(
        conn = %conn.id(),
        peer = %peer.node,
        version = peer.version,
        gender = ?gender,
        "salutation complete"
    );
    Ok(Saluted::Established { conn, peer })
}

fn check(local: NodeId, gender: Gender, theirs: &Salutation) -> Result<PeerInfo> {
    if theirs.version < MIN_PROTOCOL_VERSION {
        return Err(SyncError::VersionMismatch {
            local: PROTOCOL_VERSION,
            peer: theirs.version,
        });
    }
    if theirs.node == local {
        return Err(SyncError::SelfConnection(local));
    }
    if theirs.gender == gender {
        return Err(SyncError::EqualGenders);
    }
    Ok(PeerInfo {
        node: theirs.node,
        version: theirs.version.min(PROTOCOL_VERSION),
        gender,
    })
}

async fn read_within<T: WireMessage>(conn: &mut Connection, budget: Duration) -> Result<T> {
    let frame = tokio::time::timeout(budget, conn.read_frame())
        .await
        .map_err(|_| SyncError::Timeout(format!("waiting for {}", T::NAME)))??;
    T::from_frame(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use proofnet_store::MemoryStore;

    use crate::connection::{pipe, ConnectionId};
    use crate::context::SyncConfig;

    fn ctx(node: NodeId) -> SyncContext {
        SyncContext::new(node, Arc::new(MemoryStore::new()), SyncConfig::default())
    }

    fn conns() -> (Connection, Connection) {
        pipe(ConnectionId(1), ConnectionId(2), 1 << 20)
    }

    fn established(result: Result<Saluted>) -> PeerInfo {
        match result {
            Ok(Saluted::Established { peer, .. }) => peer,
            other => panic!("expected established, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_opposite_roles() {
        let a = ctx(NodeId::from_bytes([1; 16]));
        let b = ctx(NodeId::from_bytes([2; 16]));
        let (ca, cb) = conns();
        let (ra, rb) = tokio::join!(
            salute(&a, ca, Gender::Male, Some(b.node())),
            salute(&b, cb, Gender::Female, None)
        );
        let (pa, pb) = (established(ra), established(rb));
        assert_eq!(pa.node, b.node());
        assert_eq!(pb.node, a.node());
        assert_ne!(pa.gender, pb.gender);
        assert_eq!(pa.version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_equal_genders_rejected() {
        let a = ctx(NodeId::from_bytes([1; 16]));
        let b = ctx(NodeId::from_bytes([2; 16]));
        let (ca, cb) = conns();
        let (ra, rb) = tokio::join!(
            salute(&a, ca, Gender::Male, None),
            salute(&b, cb, Gender::Male, None)
        );
        assert!(matches!(ra, Err(SyncError::EqualGenders)));
        assert!(matches!(rb, Err(SyncError::EqualGenders)));
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let node = NodeId::from_bytes([1; 16]);
        let (a, b) = (ctx(node), ctx(node));
        let (ca, cb) = conns();
        let (ra, _) = tokio::join!(
            salute(&a, ca, Gender::Male, None),
            salute(&b, cb, Gender::Female, None)
        );
        assert!(matches!(ra, Err(SyncError::SelfConnection(_))));
    }

    #[tokio::test]
    async fn test_old_version_rejected() {
        let a = ctx(NodeId::from_bytes([1; 16]));
        let (ca, mut cb) = conns();
        let responder = tokio::spawn(async move {
            let ancient = Salutation {
                version: 0,
                gender: Gender::Female,
                node: NodeId::from_bytes([2; 16]),
                expected_peer: None,
            };
            cb.write_frame(&ancient.to_frame().unwrap()).await.unwrap();
            cb
        });
        let result = salute(&a, ca, Gender::Male, None).await;
        assert!(matches!(result, Err(SyncError::VersionMismatch { peer: 0, .. })));
        responder.await.unwrap();
    }

    /// Splices by saluting as the real target over a fresh pipe.
    struct PipeSplicer {
        target: Arc<SyncContext>,
    }

    #[async_trait]
    impl Splicer for PipeSplicer {
        async fn splice(&self, _target: NodeId, salutation: Bytes, conn: Connection) -> Result<()> {
            use tokio::io::AsyncWriteExt;

            let (near, far) = tokio::io::duplex(64 * 1024);
            let target = Arc::clone(&self.target);
            let far_side = tokio::spawn(async move {
                let conn = target.connection(Box::new(far), None);
                salute(&target, conn, Gender::Female, None).await.map(|s| match s {
                    Saluted::Established { peer, .. } => peer.node,
                    Saluted::Spliced { target } => target,
                })
            });

            let (mut reader, mut writer, buffered) = conn.into_raw()?;
            let (mut near_r, mut near_w) = tokio::io::split(near);
            near_w.write_all(&salutation).await?;
            near_w.write_all(&buffered).await?;
            let up = tokio::io::copy(&mut reader, &mut near_w);
            let down = tokio::io::copy(&mut near_r, &mut writer);
            // The far side drops its end after saluting, which ends `down`
            // once everything it wrote has been forwarded.
            tokio::select! {
                _ = up => {}
                _ = down => {}
            }
            let _ = far_side.await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mismatch_splices_to_expected() {
        let dialer = ctx(NodeId::from_bytes([1; 16]));
        let target = Arc::new(ctx(NodeId::from_bytes([3; 16])));
        let gateway = ctx(NodeId::from_bytes([2; 16])).with_splicer(Arc::new(PipeSplicer {
            target: Arc::clone(&target),
        }));

        let (ca, cb) = conns();
        let (rd, rg) = tokio::join!(
            salute(&dialer, ca, Gender::Male, Some(target.node())),
            salute(&gateway, cb, Gender::Female, None)
        );
        assert_eq!(established(rd).node, target.node());
        assert!(matches!(rg, Ok(Saluted::Spliced { target: t }) if t == target.node()));
    }

    #[tokio::test]
    async fn test_mismatch_without_splicer_fails() {
        let dialer = ctx(NodeId::from_bytes([1; 16]));
        let gateway = ctx(NodeId::from_bytes([2; 16]));
        let wanted = NodeId::from_bytes([3; 16]);
        let (ca, cb) = conns();
        let (rd, rg) = tokio::join!(
            salute(&dialer, ca, Gender::Male, Some(wanted)),
            salute(&gateway, cb, Gender::Female, None)
        );
        assert!(matches!(rg, Err(SyncError::PeerMismatch { .. })));
        assert!(rd.is_err());
    }
}
