//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use proofnet::{ConnectionHandle, Node, NodeConfig, Server};
use proofnet_core::{
    now_millis, Keypair, NodeId, Person, PersonDetails, Statement, StatementAuthority, Uuid,
};
use proofnet_store::MemoryStore;
use proofnet_sync::{LockConfig, MemoryNetwork, SyncConfig};

/// A signing identity.
pub struct Author {
    pub uuid: Uuid,
    pub keypair: Keypair,
}

impl Author {
    /// Create an author with a random keypair.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            keypair: Keypair::generate(),
        }
    }

    /// Create with a deterministic keypair from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&seed[..16]);
        Self {
            uuid: Uuid::from_bytes(id),
            keypair: Keypair::from_seed(&seed),
        }
    }

    /// This author's person record, self-signed now.
    pub fn person(&self, nick: &str) -> Person {
        Person::signed(self.uuid, &self.keypair, PersonDetails::nick(nick), now_millis())
    }

    /// An authority over `statement` carrying this author's signature.
    pub fn authority(&self, statement: &Statement) -> StatementAuthority {
        let at = now_millis();
        let mut authority = StatementAuthority::new(statement.uuid, statement.context, self.uuid, at);
        authority.sign(self.uuid, &self.keypair, at, false);
        authority
    }
}

impl Default for Author {
    fn default() -> Self {
        Self::new()
    }
}

/// Sync configuration with short timeouts, for tests.
pub fn fast_config(node: NodeId) -> NodeConfig {
    let mut config = NodeConfig::new(node);
    config.sync = SyncConfig {
        dialog_budget_ms: 5_000,
        idle_timeout_ms: 5_000,
        lock: LockConfig {
            base_timeout_ms: 20,
            jitter_ms: 20,
        },
        ..SyncConfig::default()
    };
    config
}

/// Two nodes on one in-memory network; `b` accepts connections.
pub struct NodePair {
    pub network: Arc<MemoryNetwork>,
    pub a: Node,
    pub b: Node,
    server: Server,
}

impl NodePair {
    pub const A_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7400);
    pub const B_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 7400);

    pub async fn new() -> Self {
        Self::with_configs(fast_config(NodeId::random()), fast_config(NodeId::random())).await
    }

    pub async fn with_configs(a: NodeConfig, b: NodeConfig) -> Self {
        let network = MemoryNetwork::new();
        let a = Node::new(a, Arc::new(MemoryStore::new()), Arc::new(network.transport(Self::A_ADDR)));
        let b = Node::new(b, Arc::new(MemoryStore::new()), Arc::new(network.transport(Self::B_ADDR)));
        let server = b.serve(network.listen(Self::B_ADDR).await);
        Self { network, a, b, server }
    }

    /// Open a statement session from `a` to `b`. Returns the dialer's
    /// handle and the acceptor's.
    pub async fn connect(&mut self) -> proofnet::Result<(ConnectionHandle, ConnectionHandle)> {
        let dialer = self.a.connect(Self::B_ADDR, Some(self.b.id())).await?;
        let acceptor = self
            .server
            .next()
            .await
            .ok_or_else(|| proofnet::NodeError::Task("listener closed".into()))?;
        Ok((dialer, acceptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proofnet::{SessionOutcome, SessionStage};
    use proofnet_core::{StatementBuilder, StatementKind};

    #[test]
    fn test_authority_verifies_against_author() {
        let author = Author::with_seed([4; 32]);
        let root = StatementBuilder::root_context().build();
        let authority = author.authority(&root);
        let key = author.keypair.public_key();
        assert!(authority.verify(|uuid| (*uuid == author.uuid).then_some(key)).is_ok());
        assert!(author.person("ada").verify().is_ok());
    }

    #[tokio::test]
    async fn test_signed_statements_replicate_with_signers() {
        let mut pair = NodePair::new().await;
        let author = Author::new();
        let root = StatementBuilder::root_context().build();
        let axiom = StatementBuilder::new(StatementKind::Axiom).context(root.uuid).build();
        pair.a.put_person(author.person("ada")).await.unwrap();
        pair.a.put_statements(vec![root.clone(), axiom.clone()]).await.unwrap();
        pair.a.put_authority(author.authority(&axiom)).await.unwrap();
        pair.b.subscribe(root.uuid, true).await.unwrap();

        let (dialer, acceptor) = pair.connect().await.unwrap();
        let mut stage = acceptor.stage();
        tokio::time::timeout(
            Duration::from_secs(10),
            stage.wait_for(|s| matches!(s, SessionStage::Loop { .. })),
        )
        .await
        .unwrap()
        .unwrap();
        drop(stage);

        let store = pair.b.store();
        let txn = store.begin(None).await.unwrap();
        assert!(store.authority(&txn, &axiom.uuid).await.unwrap().is_some());
        assert!(store.person(&txn, &author.uuid).await.unwrap().is_some());
        store.abort(txn).await;

        dialer.request_valediction();
        assert!(matches!(dialer.join().await.unwrap(), SessionOutcome::Statement(_)));
        assert!(matches!(acceptor.join().await.unwrap(), SessionOutcome::Statement(_)));
    }
}
