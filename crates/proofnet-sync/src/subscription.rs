//! Per-connection state fed by store commits.
//!
//! Every statement connection registers a [`ConnectionListener`] on the
//! store. After each commit made elsewhere (another connection, local
//! authoring) the listener records what changed that the peer cares about in
//! [`PendingPersistentDataChanges`] and queues the loop dialog that will push
//! it. Commits made by the connection itself are ignored.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{futures::Notified, watch, Notify};

use proofnet_core::Uuid;
use proofnet_store::{Change, CommitEvent, StoreListener};

use crate::connection::ConnectionId;
use crate::phase::LoopDialogType;
use crate::wire::MIN_PROTOCOL_VERSION;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Command queue
// ─────────────────────────────────────────────────────────────────────────────

/// FIFO of pending commands, deduplicated by value.
#[derive(Debug, Default)]
pub struct CommandQueue<V> {
    items: Mutex<VecDeque<V>>,
    notify: Notify,
}

impl<V: Copy + PartialEq> CommandQueue<V> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Queue `value` unless it is already queued. Returns true if queued.
    pub fn push(&self, value: V) -> bool {
        let mut items = locked(&self.items);
        if items.contains(&value) {
            return false;
        }
        items.push_back(value);
        drop(items);
        self.notify.notify_one();
        true
    }

    /// Queue `value` ahead of everything else, moving it if already queued.
    pub fn push_front(&self, value: V) {
        let mut items = locked(&self.items);
        items.retain(|v| *v != value);
        items.push_front(value);
        drop(items);
        self.notify.notify_one();
    }

    pub fn peek(&self) -> Option<V> {
        locked(&self.items).front().copied()
    }

    pub fn remove(&self, value: V) -> bool {
        let mut items = locked(&self.items);
        let before = items.len();
        items.retain(|v| *v != value);
        items.len() != before
    }

    /// Completes after the next push, or at once if a push happened since
    /// the last wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn contains(&self, value: V) -> bool {
        locked(&self.items).contains(&value)
    }

    pub fn clear(&self) {
        locked(&self.items).clear();
    }

    pub fn snapshot(&self) -> Vec<V> {
        locked(&self.items).iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        locked(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        locked(&self.items).is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote interest and pending changes
// ─────────────────────────────────────────────────────────────────────────────

/// What the peer declared interest in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSubscription {
    /// Contexts the peer subscribed to.
    pub contexts: BTreeSet<Uuid>,
    /// `contexts` plus every locally known context nested inside them.
    pub covered: BTreeSet<Uuid>,
    /// Statements whose proofs the peer subscribed to.
    pub proofs: BTreeSet<Uuid>,
}

impl RemoteSubscription {
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty() && self.covered.is_empty() && self.proofs.is_empty()
    }

    /// Whether a new statement in `context` (or the context itself) is of
    /// interest to the peer.
    pub fn covers(&self, uuid: &Uuid, context: Option<&Uuid>) -> bool {
        self.covered.contains(uuid) || context.is_some_and(|c| self.covered.contains(c))
    }
}

/// Local changes observed since the last round that pushed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingPersistentDataChanges {
    pub subscriptions_changed: bool,
    pub proof_subscriptions_changed: bool,
    pub new_statements: BTreeSet<Uuid>,
    /// Statements with a new proof or signature. Root contexts stand for
    /// their root signatures.
    pub new_signed_proofs: BTreeSet<Uuid>,
    /// Root contexts whose delegate tree changed.
    pub delegate_trees: BTreeSet<Uuid>,
    pub persons: BTreeSet<Uuid>,
    pub deferred: BTreeSet<Uuid>,
}

impl PendingPersistentDataChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection state
// ─────────────────────────────────────────────────────────────────────────────

/// Where a statement connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Connecting,
    Initial,
    /// Looping; `completed` counts finished loop dialogs.
    Loop { completed: usize },
    Closed,
}

/// State shared between a statement connection and its store listener.
#[derive(Debug)]
pub struct ConnectionState {
    connection: ConnectionId,
    peer_version: AtomicU16,
    remote: Mutex<RemoteSubscription>,
    pending: Mutex<PendingPersistentDataChanges>,
    commands: CommandQueue<LoopDialogType>,
    stage: watch::Sender<SessionStage>,
}

impl ConnectionState {
    pub fn new(connection: ConnectionId) -> Self {
        let (stage, _) = watch::channel(SessionStage::Connecting);
        Self {
            connection,
            peer_version: AtomicU16::new(MIN_PROTOCOL_VERSION),
            remote: Mutex::new(RemoteSubscription::default()),
            pending: Mutex::new(PendingPersistentDataChanges::default()),
            commands: CommandQueue::new(),
            stage,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn peer_version(&self) -> u16 {
        self.peer_version.load(Ordering::Acquire)
    }

    pub fn set_peer_version(&self, version: u16) {
        self.peer_version.store(version, Ordering::Release);
    }

    pub fn commands(&self) -> &CommandQueue<LoopDialogType> {
        &self.commands
    }

    /// Queue a loop dialog if the peer can run it.
    pub fn request(&self, kind: LoopDialogType) -> bool {
        kind.required_version() <= self.peer_version() && self.commands.push(kind)
    }

    /// Ask the loop to end after the dialog in progress, ahead of any
    /// queued work.
    pub fn request_valediction(&self) {
        self.commands.push_front(LoopDialogType::Valediction);
    }

    pub fn remote(&self) -> RemoteSubscription {
        locked(&self.remote).clone()
    }

    pub fn with_remote<R>(&self, f: impl FnOnce(&mut RemoteSubscription) -> R) -> R {
        f(&mut locked(&self.remote))
    }

    pub fn pending(&self) -> PendingPersistentDataChanges {
        locked(&self.pending).clone()
    }

    pub fn with_pending<R>(&self, f: impl FnOnce(&mut PendingPersistentDataChanges) -> R) -> R {
        f(&mut locked(&self.pending))
    }

    pub fn stage(&self) -> watch::Receiver<SessionStage> {
        self.stage.subscribe()
    }

    pub(crate) fn set_stage(&self, stage: SessionStage) {
        self.stage.send_replace(stage);
    }

    pub(crate) fn note_completed(&self) {
        self.stage.send_modify(|stage| {
            if let SessionStage::Loop { completed } = stage {
                *completed += 1;
            }
        });
    }

    /// Forget everything about the peer.
    pub fn clear(&self) {
        *locked(&self.remote) = RemoteSubscription::default();
        locked(&self.pending).clear();
        self.commands.clear();
    }

    fn observe(&self, change: &Change) {
        let version = self.peer_version();
        let mut remote = locked(&self.remote);
        let mut pending = locked(&self.pending);
        let queued = match change {
            Change::SetSubscribed { .. } => {
                pending.subscriptions_changed = true;
                Some(LoopDialogType::StatementSubscription)
            }
            Change::SetProofSubscribed { .. } => {
                pending.proof_subscriptions_changed = true;
                Some(LoopDialogType::StatementProofSubscription)
            }
            Change::PutStatement(statement) => {
                if remote.covers(&statement.uuid, statement.context.as_ref()) {
                    if statement.is_context() {
                        remote.covered.insert(statement.uuid);
                    }
                    pending.new_statements.insert(statement.uuid);
                    Some(LoopDialogType::NewStatements)
                } else {
                    None
                }
            }
            Change::PutAuthority(authority) => {
                let root_signature =
                    authority.context.is_none() && remote.contexts.contains(&authority.statement);
                if root_signature || remote.proofs.contains(&authority.statement) {
                    pending.new_signed_proofs.insert(authority.statement);
                    Some(LoopDialogType::NewSignedProofs)
                } else {
                    None
                }
            }
            Change::PutProof(proof) if remote.proofs.contains(&proof.statement) => {
                pending.new_signed_proofs.insert(proof.statement);
                Some(LoopDialogType::NewSignedProofs)
            }
            Change::PutDelegateTree(tree) if remote.contexts.contains(&tree.root) => {
                pending.delegate_trees.insert(tree.root);
                Some(LoopDialogType::DelegateTree)
            }
            Change::PutPerson(person) if LoopDialogType::Persons.required_version() <= version => {
                pending.persons.insert(person.uuid);
                Some(LoopDialogType::Persons)
            }
            Change::PutDeferredMessage(message)
                if LoopDialogType::DeferredMessages.required_version() <= version =>
            {
                pending.deferred.insert(message.uuid);
                Some(LoopDialogType::DeferredMessages)
            }
            _ => None,
        };
        drop(pending);
        drop(remote);
        if let Some(kind) = queued {
            self.request(kind);
        }
    }
}

/// Store listener of one statement connection.
pub struct ConnectionListener {
    state: Arc<ConnectionState>,
}

impl ConnectionListener {
    pub fn new(state: Arc<ConnectionState>) -> Self {
        Self { state }
    }
}

impl StoreListener for ConnectionListener {
    fn on_commit(&self, event: &CommitEvent) {
        if event.origin == Some(self.state.connection.0) {
            return;
        }
        for change in &event.changes {
            self.state.observe(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proofnet_core::{
        DeferredMessage, Keypair, NodeId, Person, PersonDetails, StatementAuthority,
        StatementBuilder, StatementKind,
    };

    fn state(version: u16) -> Arc<ConnectionState> {
        let state = Arc::new(ConnectionState::new(ConnectionId(7)));
        state.set_peer_version(version);
        state
    }

    fn commit(listener: &ConnectionListener, origin: Option<u64>, changes: Vec<Change>) {
        listener.on_commit(&CommitEvent { origin, changes });
    }

    #[test]
    fn test_queue_dedups_and_keeps_order() {
        let queue = CommandQueue::new();
        assert!(queue.push(3u8));
        assert!(queue.push(1));
        assert!(!queue.push(3));
        assert_eq!(queue.snapshot(), vec![3, 1]);
        assert!(queue.remove(3));
        assert_eq!(queue.peek(), Some(1));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_own_commits_ignored() {
        let state = state(2);
        let listener = ConnectionListener::new(Arc::clone(&state));
        let change = Change::SetSubscribed {
            context: Uuid::new_v4(),
            subscribed: true,
        };
        commit(&listener, Some(7), vec![change.clone()]);
        assert!(state.pending().is_empty());
        assert!(state.commands().is_empty());

        commit(&listener, Some(8), vec![change]);
        assert!(state.pending().subscriptions_changed);
        assert_eq!(state.commands().snapshot(), vec![LoopDialogType::StatementSubscription]);
    }

    #[test]
    fn test_statements_tracked_inside_remote_subscription() {
        let state = state(2);
        let listener = ConnectionListener::new(Arc::clone(&state));
        let root = StatementBuilder::root_context().build();
        let nested = StatementBuilder::new(StatementKind::Context).context(root.uuid).build();
        let deep = StatementBuilder::new(StatementKind::Axiom).context(nested.uuid).build();
        let elsewhere = StatementBuilder::new(StatementKind::Axiom).context(Uuid::new_v4()).build();

        state.with_remote(|remote| {
            remote.contexts.insert(root.uuid);
            remote.covered.insert(root.uuid);
        });
        commit(
            &listener,
            None,
            vec![
                Change::PutStatement(nested.clone()),
                Change::PutStatement(deep.clone()),
                Change::PutStatement(elsewhere),
            ],
        );

        let pending = state.pending();
        assert_eq!(pending.new_statements, [nested.uuid, deep.uuid].into_iter().collect());
        assert!(state.remote().covered.contains(&nested.uuid));
        assert_eq!(state.commands().snapshot(), vec![LoopDialogType::NewStatements]);
    }

    #[test]
    fn test_signatures_routed_by_interest() {
        let state = state(2);
        let listener = ConnectionListener::new(Arc::clone(&state));
        let root = Uuid::new_v4();
        let proved = Uuid::new_v4();
        state.with_remote(|remote| {
            remote.contexts.insert(root);
            remote.proofs.insert(proved);
        });
        let author = Uuid::new_v4();
        commit(
            &listener,
            None,
            vec![
                Change::PutAuthority(StatementAuthority::new(root, None, author, 1)),
                Change::PutAuthority(StatementAuthority::new(proved, Some(root), author, 1)),
                Change::PutAuthority(StatementAuthority::new(Uuid::new_v4(), Some(root), author, 1)),
            ],
        );
        assert_eq!(state.pending().new_signed_proofs, [root, proved].into_iter().collect());
    }

    #[test]
    fn test_version_one_peer_gets_no_supplemented_dialogs() {
        let state = state(1);
        let listener = ConnectionListener::new(Arc::clone(&state));
        let kp = Keypair::from_seed(&[4; 32]);
        let person = Person::signed(Uuid::new_v4(), &kp, PersonDetails::nick("ada"), 10);
        commit(
            &listener,
            None,
            vec![
                Change::PutPerson(person),
                Change::PutDeferredMessage(DeferredMessage::new(NodeId::random(), b"hi".to_vec())),
            ],
        );
        assert!(state.pending().is_empty());
        assert!(state.commands().is_empty());
    }

    #[test]
    fn test_valediction_jumps_queued_work() {
        let state = state(2);
        assert!(state.request(LoopDialogType::NewStatements));
        assert!(state.request(LoopDialogType::Persons));
        state.request_valediction();
        assert_eq!(state.commands().peek(), Some(LoopDialogType::Valediction));
        state.request_valediction();
        assert_eq!(
            state.commands().snapshot(),
            vec![
                LoopDialogType::Valediction,
                LoopDialogType::NewStatements,
                LoopDialogType::Persons
            ]
        );
    }

    #[test]
    fn test_clear_forgets_peer() {
        let state = state(2);
        state.with_remote(|remote| {
            remote.contexts.insert(Uuid::new_v4());
        });
        state.with_pending(|pending| pending.subscriptions_changed = true);
        state.request_valediction();
        state.clear();
        assert!(state.remote().is_empty());
        assert!(state.pending().is_empty());
        assert!(state.commands().is_empty());
    }
}
