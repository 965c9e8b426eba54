//! Store trait: the transactional interface the sync engine consumes.
//!
//! The store is deliberately dumb. It stages changes in a [`Transaction`],
//! applies them atomically on commit and tells registered listeners what
//! changed. Merge rules (person info monotonicity, authority signature
//! merging) are decided by callers before they stage a change.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use proofnet_core::{
    DeferredMessage, DelegateTree, NodeId, Person, SignatureRequest, Statement,
    StatementAuthority, StatementProof, Uuid,
};

use crate::error::Result;

/// One staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert a statement. Re-inserting an identical statement is a no-op.
    PutStatement(Statement),
    /// Set or clear the local subscription flag of a context.
    SetSubscribed { context: Uuid, subscribed: bool },
    /// Set or clear interest in the proof of a statement.
    SetProofSubscribed { statement: Uuid, subscribed: bool },
    /// Replace the authority of a statement.
    PutAuthority(StatementAuthority),
    /// Replace the proof of a statement.
    PutProof(StatementProof),
    /// Replace a person.
    PutPerson(Person),
    /// Replace the delegate tree of a root context.
    PutDelegateTree(DelegateTree),
    /// Queue a deferred message.
    PutDeferredMessage(DeferredMessage),
    /// Drop a deferred message (delivered or expired).
    RemoveDeferredMessage(Uuid),
    /// Record a signature request.
    PutSignatureRequest(SignatureRequest),
}

/// A unit of atomic mutation.
///
/// Holds the changes staged so far and the connection that opened it, so
/// listeners can tell their own writes from everyone else's.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    origin: Option<u64>,
    staged: Vec<Change>,
}

impl Transaction {
    /// Used by store implementations.
    pub fn new(id: u64, origin: Option<u64>) -> Self {
        Self {
            id,
            origin,
            staged: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connection that opened this transaction, if any.
    pub fn origin(&self) -> Option<u64> {
        self.origin
    }

    /// Stage a change. Later reads through this transaction observe it.
    pub fn stage(&mut self, change: Change) {
        self.staged.push(change);
    }

    /// Changes staged so far, in order.
    pub fn staged(&self) -> &[Change] {
        &self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub(crate) fn into_changes(self) -> Vec<Change> {
        self.staged
    }
}

/// What a commit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub origin: Option<u64>,
    pub changes: Vec<Change>,
}

/// Callback invoked after every successful, non-empty commit.
pub trait StoreListener: Send + Sync {
    fn on_commit(&self, event: &CommitEvent);
}

/// Handle returned by [`Store::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The Store trait: transactional access to everything the sync engine
/// replicates.
///
/// All reads take the transaction they run in and observe committed state
/// overlaid with that transaction's staged changes.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────────

    /// Open a transaction on behalf of `origin` (a connection id).
    async fn begin(&self, origin: Option<u64>) -> Result<Transaction>;

    /// Apply every staged change atomically, then notify listeners.
    async fn commit(&self, txn: Transaction) -> Result<CommitEvent>;

    /// Discard a transaction.
    async fn abort(&self, txn: Transaction);

    // ─────────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────────

    fn add_listener(&self, listener: Arc<dyn StoreListener>) -> Result<ListenerId>;

    fn remove_listener(&self, id: ListenerId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    async fn statement(&self, txn: &Transaction, uuid: &Uuid) -> Result<Option<Statement>>;

    async fn has_statement(&self, txn: &Transaction, uuid: &Uuid) -> Result<bool> {
        Ok(self.statement(txn, uuid).await?.is_some())
    }

    /// Statements whose containing context is `context`.
    async fn statements_in_context(&self, txn: &Transaction, context: &Uuid)
        -> Result<Vec<Statement>>;

    /// Uuids of all root contexts.
    async fn root_contexts(&self, txn: &Transaction) -> Result<Vec<Uuid>>;

    /// Contexts the local user subscribed to.
    async fn subscribed_contexts(&self, txn: &Transaction) -> Result<BTreeSet<Uuid>>;

    /// Statements whose proofs the local user wants.
    async fn proof_subscriptions(&self, txn: &Transaction) -> Result<BTreeSet<Uuid>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Signatures, proofs, persons
    // ─────────────────────────────────────────────────────────────────────────

    async fn authority(&self, txn: &Transaction, statement: &Uuid)
        -> Result<Option<StatementAuthority>>;

    async fn proof(&self, txn: &Transaction, statement: &Uuid) -> Result<Option<StatementProof>>;

    async fn person(&self, txn: &Transaction, uuid: &Uuid) -> Result<Option<Person>>;

    async fn persons(&self, txn: &Transaction) -> Result<Vec<Person>>;

    async fn delegate_tree(&self, txn: &Transaction, root: &Uuid) -> Result<Option<DelegateTree>>;

    async fn delegate_trees(&self, txn: &Transaction) -> Result<Vec<DelegateTree>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Relay
    // ─────────────────────────────────────────────────────────────────────────

    async fn deferred_messages(&self, txn: &Transaction) -> Result<Vec<DeferredMessage>>;

    async fn deferred_messages_for(
        &self,
        txn: &Transaction,
        recipient: &NodeId,
    ) -> Result<Vec<DeferredMessage>> {
        Ok(self
            .deferred_messages(txn)
            .await?
            .into_iter()
            .filter(|m| &m.recipient == recipient)
            .collect())
    }

    async fn signature_request(&self, txn: &Transaction, uuid: &Uuid)
        -> Result<Option<SignatureRequest>>;

    async fn signature_requests(&self, txn: &Transaction) -> Result<Vec<SignatureRequest>>;
}
