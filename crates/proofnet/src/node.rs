//! The node: one store, one sync context, many connections.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use proofnet_core::{
    validate_statement, DeferredMessage, NodeId, Person, SignatureRequest, Statement,
    StatementAuthority, Uuid,
};
use proofnet_store::{Change, Store};
use proofnet_sync::connection::BoxedStream;
use proofnet_sync::{
    deliver_deferred, run_session, ClosestNode, ConnectionState, Endpoint, MemoryListener,
    NodeAddress, RouteSplicer, RoutingTable, SessionIntent, SessionOutcome, SessionStage, SyncContext,
    Transport,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// A running statement connection, or any other session, owned by a task.
pub struct ConnectionHandle {
    state: Arc<ConnectionState>,
    task: JoinHandle<proofnet_sync::Result<SessionOutcome>>,
}

impl ConnectionHandle {
    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    /// Ask the statement loop to end once the current dialog finishes.
    pub fn request_valediction(&self) {
        self.state.request_valediction();
    }

    pub fn stage(&self) -> watch::Receiver<SessionStage> {
        self.state.stage()
    }

    /// Wait for the session to end.
    pub async fn join(self) -> Result<SessionOutcome> {
        match self.task.await {
            Ok(outcome) => Ok(outcome?),
            Err(e) => Err(NodeError::Task(e.to_string())),
        }
    }
}

/// Accept loop started by [`Node::serve`].
pub struct Server {
    task: JoinHandle<()>,
    accepted: mpsc::UnboundedReceiver<ConnectionHandle>,
}

impl Server {
    /// Next accepted connection.
    pub async fn next(&mut self) -> Option<ConnectionHandle> {
        self.accepted.recv().await
    }

    /// Stop accepting. Running connections are not affected.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// A proofnet node.
#[derive(Clone)]
pub struct Node {
    ctx: Arc<SyncContext>,
    routes: Arc<RoutingTable>,
    transport: Arc<dyn Transport>,
}

impl Node {
    /// Build a node over `store`, dialing out through `transport`.
    pub fn new(config: NodeConfig, store: Arc<dyn Store>, transport: Arc<dyn Transport>) -> Self {
        let routes = Arc::new(RoutingTable::new(config.node));
        for route in &config.routes {
            routes.insert(route.node, route.address);
        }
        let closest: Arc<dyn ClosestNode> = routes.clone();
        let ctx = SyncContext::new(config.node, store, config.sync)
            .with_routes(Arc::clone(&closest))
            .with_splicer(Arc::new(RouteSplicer::new(Arc::clone(&transport), closest)));
        tracing::info!(node = %config.node, routes = config.routes.len(), "node created");
        Self {
            ctx: Arc::new(ctx),
            routes,
            transport,
        }
    }

    pub fn id(&self) -> NodeId {
        self.ctx.node()
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.ctx.store()
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    /// Dial `addr` and start a statement session. `expected` is the node we
    /// mean to reach; a different node at `addr` splices us through.
    pub async fn connect(&self, addr: SocketAddr, expected: Option<NodeId>) -> Result<ConnectionHandle> {
        let stream = self.transport.connect(addr).await?;
        Ok(self.spawn(
            stream,
            Some(addr),
            Endpoint::Dialer {
                expected,
                intent: SessionIntent::Statement,
            },
        ))
    }

    /// Serve a stream a peer opened to us.
    pub fn accept(&self, stream: BoxedStream, from: Option<SocketAddr>) -> ConnectionHandle {
        self.spawn(stream, from, Endpoint::Acceptor)
    }

    /// Accept connections from an in-memory listener until it closes.
    pub fn serve(&self, mut listener: MemoryListener) -> Server {
        let (tx, accepted) = mpsc::unbounded_channel();
        let node = self.clone();
        let task = tokio::spawn(async move {
            while let Some((stream, from)) = listener.accept().await {
                let _ = tx.send(node.accept(stream, Some(from)));
            }
        });
        Server { task, accepted }
    }

    /// Accept TCP connections until the listener fails.
    pub fn serve_tcp(&self, listener: tokio::net::TcpListener) -> Server {
        let (tx, accepted) = mpsc::unbounded_channel();
        let node = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, from) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed, stopping listener");
                        break;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %from, error = %e, "could not disable nagle");
                }
                let _ = tx.send(node.accept(Box::new(stream), Some(from)));
            }
        });
        Server { task, accepted }
    }

    fn spawn(&self, stream: BoxedStream, addr: Option<SocketAddr>, endpoint: Endpoint) -> ConnectionHandle {
        let conn = self.ctx.connection(stream, addr);
        let state = Arc::new(ConnectionState::new(conn.id()));
        let ctx = Arc::clone(&self.ctx);
        let session_state = Arc::clone(&state);
        let task = tokio::spawn(async move { run_session(&ctx, conn, endpoint, session_state).await });
        ConnectionHandle { state, task }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deferred messages and signature requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Send `content` to `recipient` through the relay.
    ///
    /// Returns the node that took custody: the node the redirects ended
    /// at, or this node when no route leads closer to the recipient or the
    /// route could not be followed.
    pub async fn send_deferred(&self, recipient: NodeId, content: impl Into<Bytes>) -> Result<NodeId> {
        let message = DeferredMessage::new(recipient, content);
        let first = self.ctx.routes().closest(&recipient).await;
        Ok(deliver_deferred(&self.ctx, self.transport.as_ref(), first, message).await?)
    }

    /// Hand `content` for `recipient` to a known relay, following its
    /// redirects. Returns the node that took custody; this node when the
    /// relay could not be reached.
    pub async fn send_deferred_via(
        &self,
        relay: NodeAddress,
        recipient: NodeId,
        content: impl Into<Bytes>,
    ) -> Result<NodeId> {
        let message = DeferredMessage::new(recipient, content);
        Ok(deliver_deferred(&self.ctx, self.transport.as_ref(), relay, message).await?)
    }

    /// Deferred messages addressed to this node.
    pub async fn inbox(&self) -> Result<Vec<DeferredMessage>> {
        let txn = self.store().begin(None).await?;
        let messages = self.store().deferred_messages_for(&txn, &self.id()).await;
        self.store().abort(txn).await;
        Ok(messages?)
    }

    /// Deliver a signature request to the node at `addr`. Returns whether
    /// the peer accepted it.
    pub async fn request_signatures(
        &self,
        addr: SocketAddr,
        expected: Option<NodeId>,
        request: SignatureRequest,
    ) -> Result<bool> {
        let stream = self.transport.connect(addr).await?;
        let handle = self.spawn(
            stream,
            Some(addr),
            Endpoint::Dialer {
                expected,
                intent: SessionIntent::SignatureRequest(request),
            },
        );
        match handle.join().await? {
            SessionOutcome::SignatureRequest { accepted, .. } => Ok(accepted),
            SessionOutcome::Refused(_) => Ok(false),
            other => Err(NodeError::UnexpectedOutcome(format!("{other:?}"))),
        }
    }

    /// Signature requests other nodes delivered here.
    pub async fn signature_requests(&self) -> Result<Vec<SignatureRequest>> {
        let txn = self.store().begin(None).await?;
        let requests = self.store().signature_requests(&txn).await;
        self.store().abort(txn).await;
        Ok(requests?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local authoring
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to (or unsubscribe from) the statements of a context.
    pub async fn subscribe(&self, context: Uuid, subscribed: bool) -> Result<()> {
        self.apply(vec![Change::SetSubscribed { context, subscribed }]).await
    }

    /// Subscribe to (or unsubscribe from) the proof of a statement.
    pub async fn subscribe_proof(&self, statement: Uuid, subscribed: bool) -> Result<()> {
        self.apply(vec![Change::SetProofSubscribed { statement, subscribed }])
            .await
    }

    /// Add statements, in dependency order, in one transaction.
    pub async fn put_statements(&self, statements: Vec<Statement>) -> Result<()> {
        let mut changes = Vec::with_capacity(statements.len());
        for statement in statements {
            validate_statement(&statement)?;
            changes.push(Change::PutStatement(statement));
        }
        self.apply(changes).await
    }

    /// Record an authority over a statement held locally.
    pub async fn put_authority(&self, authority: StatementAuthority) -> Result<()> {
        if self.statement(&authority.statement).await?.is_none() {
            return Err(NodeError::StatementNotFound(authority.statement.to_string()));
        }
        self.apply(vec![Change::PutAuthority(authority)]).await
    }

    pub async fn put_person(&self, person: Person) -> Result<()> {
        person.verify()?;
        self.apply(vec![Change::PutPerson(person)]).await
    }

    pub async fn statement(&self, uuid: &Uuid) -> Result<Option<Statement>> {
        let txn = self.store().begin(None).await?;
        let statement = self.store().statement(&txn, uuid).await;
        self.store().abort(txn).await;
        Ok(statement?)
    }

    pub async fn person(&self, uuid: &Uuid) -> Result<Option<Person>> {
        let txn = self.store().begin(None).await?;
        let person = self.store().person(&txn, uuid).await;
        self.store().abort(txn).await;
        Ok(person?)
    }

    async fn apply(&self, changes: Vec<Change>) -> Result<()> {
        let mut txn = self.store().begin(None).await?;
        for change in changes {
            txn.stage(change);
        }
        self.store().commit(txn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proofnet_core::{now_millis, Keypair, PersonDetails, StatementBuilder, StatementKind};
    use proofnet_store::MemoryStore;
    use proofnet_sync::MemoryNetwork;

    fn node(byte: u8) -> Node {
        let network = MemoryNetwork::new();
        let addr = SocketAddr::from(([10, 0, 0, byte], 7400));
        Node::new(
            NodeConfig::new(NodeId::from_bytes([byte; 16])),
            Arc::new(MemoryStore::new()),
            Arc::new(network.transport(addr)),
        )
    }

    #[tokio::test]
    async fn test_deferred_without_route_stays_local() {
        let node = node(1);
        let recipient = NodeId::from_bytes([9; 16]);
        let custodian = node.send_deferred(recipient, &b"hello"[..]).await.unwrap();
        assert_eq!(custodian, node.id());

        let txn = node.store().begin(None).await.unwrap();
        let held = node.store().deferred_messages(&txn).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].recipient, recipient);
        assert!(node.inbox().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authority_needs_statement() {
        let node = node(1);
        let root = StatementBuilder::root_context().build();
        let authority = StatementAuthority::new(root.uuid, None, Uuid::new_v4(), now_millis());
        assert!(matches!(
            node.put_authority(authority.clone()).await,
            Err(NodeError::StatementNotFound(_))
        ));
        node.put_statements(vec![root]).await.unwrap();
        node.put_authority(authority).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_statement_rejected() {
        let node = node(1);
        let orphan = StatementBuilder::new(StatementKind::Axiom).build();
        assert!(matches!(
            node.put_statements(vec![orphan]).await,
            Err(NodeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_person_roundtrip() {
        let node = node(1);
        let kp = Keypair::generate();
        let person = Person::signed(Uuid::new_v4(), &kp, PersonDetails::nick("ada"), 10);
        node.put_person(person.clone()).await.unwrap();
        assert_eq!(node.person(&person.uuid).await.unwrap(), Some(person));
    }
}
