//! Statement sub-root: the initial pass and the loop.
//!
//! The initial sub-phase runs a fixed sequence of persistent dialogs on
//! both sides. The loop then repeats: select a dialog type with the peer,
//! run it, until both sides agree on valediction.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use proofnet_core::{NodeId, Uuid};
use proofnet_store::{Store, Transaction};

use crate::connection::Connection;
use crate::context::SyncContext;
use crate::deferred::sync_deferred;
use crate::dialog::{run_dialog, Dialog, DialogBody};
use crate::error::{Result, SyncError};
use crate::persistent::{run_persistent, PersistentBody};
use crate::phase::LoopDialogType;
use crate::replication::{exchange_statements, offer_closure, reference_closure};
use crate::resource::{exchange_resources, Resource, ResourceType};
use crate::salutation::PeerInfo;
use crate::selection::select;
use crate::subscription::{ConnectionListener, ConnectionState, SessionStage};

/// Summary of a finished statement connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub peer: NodeId,
    /// Dialogs of the initial sub-phase, in order.
    pub initial: Vec<LoopDialogType>,
    /// Loop dialogs, in order. Valediction is not listed.
    pub dialogs: Vec<LoopDialogType>,
    pub statements_received: usize,
    /// What the peer was subscribed to when the loop ended.
    pub remote_contexts: BTreeSet<Uuid>,
    /// Whether the loop ended by agreement rather than by a fault.
    pub valediction: bool,
}

impl ConnectionReport {
    fn new(peer: NodeId) -> Self {
        Self {
            peer,
            initial: Vec::new(),
            dialogs: Vec::new(),
            statements_received: 0,
            remote_contexts: BTreeSet::new(),
            valediction: false,
        }
    }
}

pub struct StatementPhase<'a> {
    ctx: &'a SyncContext,
    conn: &'a mut Connection,
    peer: PeerInfo,
    state: Arc<ConnectionState>,
}

impl<'a> StatementPhase<'a> {
    pub fn new(
        ctx: &'a SyncContext,
        conn: &'a mut Connection,
        peer: PeerInfo,
        state: Arc<ConnectionState>,
    ) -> Self {
        Self {
            ctx,
            conn,
            peer,
            state,
        }
    }

    /// Run both sub-phases. The store listener lives exactly as long as
    /// this call; the connection state is cleared on every exit path.
    pub async fn run(self) -> Result<ConnectionReport> {
        let store = Arc::clone(self.ctx.store());
        let listener = store.add_listener(Arc::new(ConnectionListener::new(Arc::clone(&self.state))))?;
        let state = Arc::clone(&self.state);
        let conn_id = self.conn.id();

        let mut report = ConnectionReport::new(self.peer.node);
        let result = self.run_sub_phases(&mut report).await;

        if let Err(e) = store.remove_listener(listener) {
            tracing::warn!(conn = %conn_id, error = %e, "failed to remove store listener");
        }
        report.remote_contexts = state.remote().contexts;
        state.clear();
        state.set_stage(SessionStage::Closed);

        result.map(|()| report)
    }

    async fn run_sub_phases(self, report: &mut ConnectionReport) -> Result<()> {
        let Self {
            ctx,
            conn,
            peer,
            state,
        } = self;
        let conn_id = conn.id();

        state.set_stage(SessionStage::Initial);
        for kind in initial_sequence(peer.version) {
            let received = run_round(ctx, conn, &peer, &state, kind, true).await?;
            report.statements_received += received;
            report.initial.push(kind);
        }
        tracing::debug!(conn = %conn_id, dialogs = report.initial.len(), "initial sub-phase complete");

        state.set_stage(SessionStage::Loop { completed: 0 });
        let budget = ctx.config().idle_timeout().saturating_add(ctx.config().dialog_budget());
        loop {
            let mut selection = LoopSelection {
                ctx,
                state: &state,
            };
            let kind = run_dialog(conn, budget, peer.version, &mut selection).await?;
            tracing::debug!(conn = %conn_id, dialog = ?kind, "loop dialog selected");
            if kind == LoopDialogType::Valediction {
                report.valediction = true;
                break;
            }
            if kind.required_version() > peer.version {
                return Err(SyncError::UnsupportedByPeer {
                    message: kind.name(),
                    required: kind.required_version(),
                    peer: peer.version,
                });
            }
            let received = run_round(ctx, conn, &peer, &state, kind, false).await?;
            report.statements_received += received;
            report.dialogs.push(kind);
            state.note_completed();
        }
        tracing::info!(
            conn = %conn_id,
            dialogs = report.dialogs.len(),
            received = report.statements_received,
            "valediction"
        );
        Ok(())
    }
}

/// Dialogs of the initial sub-phase for a peer speaking `version`.
pub(crate) fn initial_sequence(version: u16) -> Vec<LoopDialogType> {
    [
        LoopDialogType::Persons,
        LoopDialogType::StatementSubscription,
        LoopDialogType::StatementProofSubscription,
        LoopDialogType::DeferredMessages,
    ]
    .into_iter()
    .filter(|kind| kind.required_version() <= version)
    .collect()
}

struct LoopSelection<'a> {
    ctx: &'a SyncContext,
    state: &'a ConnectionState,
}

#[async_trait]
impl DialogBody for LoopSelection<'_> {
    type Output = LoopDialogType;

    async fn run(&mut self, dialog: &mut Dialog<'_>) -> Result<LoopDialogType> {
        select(
            dialog,
            self.state.commands(),
            self.ctx.config().idle_timeout(),
            LoopDialogType::Valediction,
        )
        .await
    }
}

/// Run one persistent round and settle the pending changes it pushed.
async fn run_round(
    ctx: &SyncContext,
    conn: &mut Connection,
    peer: &PeerInfo,
    state: &ConnectionState,
    kind: LoopDialogType,
    initial: bool,
) -> Result<usize> {
    let mut body = LoopBody {
        ctx,
        state,
        peer: peer.node,
        kind,
        initial,
        taken: BTreeSet::new(),
        remote: None,
    };
    let received = run_persistent(ctx, conn, peer, &mut body).await?;
    body.settle();
    Ok(received)
}

/// One persistent loop dialog. Both sides run the same body.
struct LoopBody<'a> {
    ctx: &'a SyncContext,
    state: &'a ConnectionState,
    peer: NodeId,
    kind: LoopDialogType,
    initial: bool,
    /// Pending entries this round pushed to the peer.
    taken: BTreeSet<Uuid>,
    /// What the round learned about the peer's interest.
    remote: Option<RemoteUpdate>,
}

/// Changes to [`RemoteSubscription`](crate::subscription::RemoteSubscription),
/// applied once the round has committed.
enum RemoteUpdate {
    Subscription {
        contexts: BTreeSet<Uuid>,
        covered: BTreeSet<Uuid>,
    },
    Proofs(BTreeSet<Uuid>),
    /// Received contexts with their containing context.
    Nested(Vec<(Uuid, Option<Uuid>)>),
}

#[async_trait]
impl PersistentBody for LoopBody<'_> {
    type Output = usize;

    async fn run(&mut self, dialog: &mut Dialog<'_>, txn: &mut Transaction) -> Result<usize> {
        let ctx = self.ctx;
        let store = ctx.store().as_ref();
        match self.kind {
            LoopDialogType::StatementSubscription => self.subscription_round(dialog, store, txn).await,
            LoopDialogType::StatementProofSubscription => {
                let offered: Vec<Resource> = store
                    .proof_subscriptions(txn)
                    .await?
                    .into_iter()
                    .map(|uuid| Resource::new(ResourceType::SubscribedProofs, uuid))
                    .collect();
                let declared = exchange_resources(dialog, store, txn, &offered)
                    .await?
                    .declared(ResourceType::SubscribedProofs);
                let proofs: Vec<Resource> = declared
                    .iter()
                    .map(|uuid| Resource::new(ResourceType::StatementProof, *uuid))
                    .collect();
                exchange_resources(dialog, store, txn, &proofs).await?;
                self.remote = Some(RemoteUpdate::Proofs(declared));
                Ok(0)
            }
            LoopDialogType::NewStatements => {
                self.taken = self.state.pending().new_statements;
                let offer = reference_closure(store, txn, self.taken.iter().copied()).await?;
                let outcome = exchange_statements(dialog, store, txn, offer).await?;

                let mut nested = Vec::new();
                for uuid in &outcome.received {
                    if let Some(statement) = store.statement(txn, uuid).await? {
                        if statement.is_context() {
                            nested.push((statement.uuid, statement.context));
                        }
                    }
                }
                self.remote = Some(RemoteUpdate::Nested(nested));
                Ok(outcome.received.len())
            }
            LoopDialogType::NewSignedProofs => {
                self.taken = self.state.pending().new_signed_proofs;
                let mut offered = Vec::with_capacity(self.taken.len());
                for uuid in &self.taken {
                    let is_root = store
                        .statement(txn, uuid)
                        .await?
                        .is_some_and(|s| s.is_root_context());
                    let kind = if is_root {
                        ResourceType::RootContextSignature
                    } else {
                        ResourceType::StatementProof
                    };
                    offered.push(Resource::new(kind, *uuid));
                }
                exchange_resources(dialog, store, txn, &offered).await?;
                Ok(0)
            }
            LoopDialogType::DelegateTree => {
                self.taken = self.state.pending().delegate_trees;
                let offered = resources(ResourceType::DelegateTree, &self.taken);
                exchange_resources(dialog, store, txn, &offered).await?;
                Ok(0)
            }
            LoopDialogType::Persons => {
                self.taken = if self.initial {
                    store.persons(txn).await?.into_iter().map(|p| p.uuid).collect()
                } else {
                    self.state.pending().persons
                };
                let offered = resources(ResourceType::Person, &self.taken);
                exchange_resources(dialog, store, txn, &offered).await?;
                Ok(0)
            }
            LoopDialogType::DeferredMessages => {
                self.taken = self.state.pending().deferred;
                sync_deferred(dialog, store, txn, ctx.node(), self.peer).await?;
                Ok(0)
            }
            LoopDialogType::Valediction => Err(SyncError::Internal(
                "valediction does not run as a persistent dialog".into(),
            )),
        }
    }
}

impl LoopBody<'_> {
    /// Exchange subscriptions, the statements they cover, then the root
    /// signatures and delegate trees of subscribed roots.
    async fn subscription_round(
        &mut self,
        dialog: &mut Dialog<'_>,
        store: &dyn Store,
        txn: &mut Transaction,
    ) -> Result<usize> {
        let offered: Vec<Resource> = store
            .subscribed_contexts(txn)
            .await?
            .into_iter()
            .map(|uuid| Resource::new(ResourceType::SubscribedStatements, uuid))
            .collect();
        let contexts = exchange_resources(dialog, store, txn, &offered)
            .await?
            .declared(ResourceType::SubscribedStatements);

        let offer = offer_closure(store, txn, &contexts).await?;
        let outcome = exchange_statements(dialog, store, txn, offer).await?;

        let covered = covered_contexts(store, txn, &contexts).await?;

        let mut roots = Vec::new();
        for uuid in &contexts {
            if store
                .statement(txn, uuid)
                .await?
                .is_some_and(|s| s.is_root_context())
            {
                roots.push(Resource::new(ResourceType::RootContextSignature, *uuid));
                roots.push(Resource::new(ResourceType::DelegateTree, *uuid));
            }
        }
        exchange_resources(dialog, store, txn, &roots).await?;
        self.remote = Some(RemoteUpdate::Subscription { contexts, covered });
        Ok(outcome.received.len())
    }

    /// Apply what the committed round learned about the peer and drop the
    /// pending entries it pushed. Entries added while the round ran stay
    /// queued.
    fn settle(&mut self) {
        if let Some(update) = self.remote.take() {
            self.state.with_remote(|remote| match update {
                RemoteUpdate::Subscription { contexts, covered } => {
                    remote.contexts = contexts;
                    remote.covered = covered;
                }
                RemoteUpdate::Proofs(proofs) => remote.proofs = proofs,
                RemoteUpdate::Nested(nested) => {
                    for (uuid, context) in nested {
                        if remote.covers(&uuid, context.as_ref()) {
                            remote.covered.insert(uuid);
                        }
                    }
                }
            });
        }

        // A change committed during the round queued the dialog again.
        let requeued = self.state.commands().contains(self.kind);
        self.state.with_pending(|pending| {
            let set = match self.kind {
                LoopDialogType::StatementSubscription => {
                    pending.subscriptions_changed &= requeued;
                    return;
                }
                LoopDialogType::StatementProofSubscription => {
                    pending.proof_subscriptions_changed &= requeued;
                    return;
                }
                LoopDialogType::NewStatements => &mut pending.new_statements,
                LoopDialogType::NewSignedProofs => &mut pending.new_signed_proofs,
                LoopDialogType::DelegateTree => &mut pending.delegate_trees,
                LoopDialogType::Persons => &mut pending.persons,
                LoopDialogType::DeferredMessages => &mut pending.deferred,
                _ => return,
            };
            set.retain(|uuid| !self.taken.contains(uuid));
        });
    }
}

fn resources(kind: ResourceType, uuids: &BTreeSet<Uuid>) -> Vec<Resource> {
    uuids.iter().map(|uuid| Resource::new(kind, *uuid)).collect()
}

/// `contexts` plus every locally known context nested inside them.
async fn covered_contexts(
    store: &dyn Store,
    txn: &Transaction,
    contexts: &BTreeSet<Uuid>,
) -> Result<BTreeSet<Uuid>> {
    let mut covered = contexts.clone();
    let mut queue: VecDeque<Uuid> = contexts.iter().copied().collect();
    while let Some(context) = queue.pop_front() {
        for statement in store.statements_in_context(txn, &context).await? {
            if statement.is_context() && covered.insert(statement.uuid) {
                queue.push_back(statement.uuid);
            }
        }
    }
    Ok(covered)
}

#[cfg(test)]
mod tests {
    use super::*;

    use proofnet_core::{StatementBuilder, StatementKind};
    use proofnet_store::{Change, MemoryStore};

    use crate::connection::{pipe, ConnectionId};
    use crate::context::{LockConfig, SyncConfig};
    use crate::salutation::Gender;
    use crate::wire::{ResourceAdvertise, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

    fn ctx(byte: u8, idle_ms: u64) -> SyncContext {
        let config = SyncConfig {
            dialog_budget_ms: 2_000,
            idle_timeout_ms: idle_ms,
            lock: LockConfig {
                base_timeout_ms: 20,
                jitter_ms: 20,
            },
            ..SyncConfig::default()
        };
        SyncContext::new(NodeId::from_bytes([byte; 16]), Arc::new(MemoryStore::new()), config)
    }

    async fn stage(ctx: &SyncContext, changes: Vec<Change>) {
        let mut txn = ctx.store().begin(None).await.unwrap();
        for change in changes {
            txn.stage(change);
        }
        ctx.store().commit(txn).await.unwrap();
    }

    async fn held(ctx: &SyncContext, uuid: &Uuid) -> bool {
        let txn = ctx.store().begin(None).await.unwrap();
        ctx.store().has_statement(&txn, uuid).await.unwrap()
    }

    async fn session(
        a: &SyncContext,
        b: &SyncContext,
        version: u16,
        drive: impl std::future::Future<Output = ()>,
        states: (Arc<ConnectionState>, Arc<ConnectionState>),
    ) -> (ConnectionReport, ConnectionReport) {
        let (mut ca, mut cb) = pipe(
            states.0.connection(),
            states.1.connection(),
            a.config().max_frame_len,
        );
        let pa = PeerInfo {
            node: b.node(),
            version,
            gender: Gender::Male,
        };
        let pb = PeerInfo {
            node: a.node(),
            version,
            gender: Gender::Female,
        };
        states.0.set_peer_version(version);
        states.1.set_peer_version(version);
        let (ra, rb, ()) = tokio::join!(
            StatementPhase::new(a, &mut ca, pa, Arc::clone(&states.0)).run(),
            StatementPhase::new(b, &mut cb, pb, Arc::clone(&states.1)).run(),
            drive,
        );
        (ra.unwrap(), rb.unwrap())
    }

    fn states() -> (Arc<ConnectionState>, Arc<ConnectionState>) {
        (
            Arc::new(ConnectionState::new(ConnectionId(1))),
            Arc::new(ConnectionState::new(ConnectionId(2))),
        )
    }

    /// Reads the peer's first advertisement, then gives up.
    struct Refuse;

    #[async_trait]
    impl PersistentBody for Refuse {
        type Output = usize;

        async fn run(&mut self, dialog: &mut Dialog<'_>, _txn: &mut Transaction) -> Result<usize> {
            dialog.recv::<ResourceAdvertise>().await?;
            Err(SyncError::InvalidMessage("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_round_keeps_peer_view() {
        let (a, b) = (ctx(1, 50), ctx(2, 50));
        let root = StatementBuilder::root_context().build();
        stage(&a, vec![Change::PutStatement(root.clone())]).await;
        stage(
            &b,
            vec![Change::SetSubscribed {
                context: root.uuid,
                subscribed: true,
            }],
        )
        .await;

        let state = Arc::new(ConnectionState::new(ConnectionId(1)));
        state.with_pending(|p| p.subscriptions_changed = true);
        let (mut ca, mut cb) = pipe(ConnectionId(1), ConnectionId(2), a.config().max_frame_len);
        let pa = PeerInfo {
            node: b.node(),
            version: PROTOCOL_VERSION,
            gender: Gender::Male,
        };
        let pb = PeerInfo {
            node: a.node(),
            version: PROTOCOL_VERSION,
            gender: Gender::Female,
        };
        let refuse = async move {
            let result = run_persistent(&b, &mut cb, &pb, &mut Refuse).await;
            drop(cb);
            result
        };
        let (ra, rb) = tokio::join!(
            run_round(&a, &mut ca, &pa, &state, LoopDialogType::StatementSubscription, false),
            refuse,
        );

        assert!(ra.is_err());
        assert!(rb.is_err());
        assert!(state.pending().subscriptions_changed);
        assert!(state.remote().is_empty());
    }

    #[tokio::test]
    async fn test_committed_round_updates_peer_view() {
        let (a, b) = (ctx(1, 50), ctx(2, 50));
        let root = StatementBuilder::root_context().build();
        stage(&a, vec![Change::PutStatement(root.clone())]).await;
        stage(
            &b,
            vec![Change::SetSubscribed {
                context: root.uuid,
                subscribed: true,
            }],
        )
        .await;

        let (sa, sb) = states();
        sa.with_pending(|p| p.subscriptions_changed = true);
        let (mut ca, mut cb) = pipe(sa.connection(), sb.connection(), a.config().max_frame_len);
        let pa = PeerInfo {
            node: b.node(),
            version: PROTOCOL_VERSION,
            gender: Gender::Male,
        };
        let pb = PeerInfo {
            node: a.node(),
            version: PROTOCOL_VERSION,
            gender: Gender::Female,
        };
        let (ra, rb) = tokio::join!(
            run_round(&a, &mut ca, &pa, &sa, LoopDialogType::StatementSubscription, false),
            run_round(&b, &mut cb, &pb, &sb, LoopDialogType::StatementSubscription, false),
        );

        assert_eq!(ra.unwrap(), 0);
        assert_eq!(rb.unwrap(), 1);
        assert!(!sa.pending().subscriptions_changed);
        assert_eq!(sa.remote().contexts, BTreeSet::from([root.uuid]));
        assert!(sa.remote().covered.contains(&root.uuid));
    }

    #[test]
    fn test_initial_sequence_by_version() {
        assert_eq!(
            initial_sequence(MIN_PROTOCOL_VERSION),
            vec![
                LoopDialogType::StatementSubscription,
                LoopDialogType::StatementProofSubscription
            ]
        );
        assert_eq!(initial_sequence(PROTOCOL_VERSION).len(), 4);
        assert_eq!(initial_sequence(PROTOCOL_VERSION)[0], LoopDialogType::Persons);
    }

    #[tokio::test]
    async fn test_subscription_pulls_context_on_initial_pass() {
        let (a, b) = (ctx(1, 50), ctx(2, 50));
        let root = StatementBuilder::root_context().build();
        let nested = StatementBuilder::new(StatementKind::Context).context(root.uuid).build();
        let axiom = StatementBuilder::new(StatementKind::Axiom).context(nested.uuid).build();
        stage(
            &a,
            vec![
                Change::PutStatement(root.clone()),
                Change::PutStatement(nested.clone()),
                Change::PutStatement(axiom.clone()),
            ],
        )
        .await;
        stage(
            &b,
            vec![Change::SetSubscribed {
                context: root.uuid,
                subscribed: true,
            }],
        )
        .await;

        let (ra, rb) = session(&a, &b, PROTOCOL_VERSION, async {}, states()).await;

        for s in [&root, &nested, &axiom] {
            assert!(held(&b, &s.uuid).await);
        }
        assert_eq!(rb.statements_received, 3);
        assert_eq!(ra.remote_contexts, BTreeSet::from([root.uuid]));
        assert!(ra.valediction && rb.valediction);
        assert_eq!(ra.initial, rb.initial);
    }

    #[tokio::test]
    async fn test_new_statement_pushed_in_loop() {
        let (a, b) = (ctx(1, 400), ctx(2, 400));
        let root = StatementBuilder::root_context().build();
        stage(&a, vec![Change::PutStatement(root.clone())]).await;
        stage(
            &b,
            vec![Change::SetSubscribed {
                context: root.uuid,
                subscribed: true,
            }],
        )
        .await;

        let late = StatementBuilder::new(StatementKind::Axiom).context(root.uuid).build();
        let (sa, sb) = states();
        let watch_a = Arc::clone(&sa);
        let drive = async {
            let mut stage_rx = watch_a.stage();
            stage_rx
                .wait_for(|s| matches!(s, SessionStage::Loop { .. }))
                .await
                .unwrap();
            stage(&a, vec![Change::PutStatement(late.clone())]).await;
        };
        let (ra, rb) = session(&a, &b, PROTOCOL_VERSION, drive, (sa, sb)).await;

        assert!(held(&b, &late.uuid).await);
        assert!(ra.dialogs.contains(&LoopDialogType::NewStatements));
        assert_eq!(ra.dialogs, rb.dialogs);
    }

    #[tokio::test]
    async fn test_uncovered_statement_not_queued() {
        let (a, b) = (ctx(1, 100), ctx(2, 100));
        let (sa, sb) = states();
        let watch_a = Arc::clone(&sa);
        let other = StatementBuilder::root_context().build();
        let drive = async {
            let mut stage_rx = watch_a.stage();
            stage_rx
                .wait_for(|s| matches!(s, SessionStage::Loop { .. }))
                .await
                .unwrap();
            stage(&a, vec![Change::PutStatement(other.clone())]).await;
        };
        let (ra, _) = session(&a, &b, PROTOCOL_VERSION, drive, (sa, sb)).await;

        assert!(!held(&b, &other.uuid).await);
        assert!(!ra.dialogs.contains(&LoopDialogType::NewStatements));
    }

    #[tokio::test]
    async fn test_teardown_clears_state() {
        let (a, b) = (ctx(1, 30), ctx(2, 30));
        let root = StatementBuilder::root_context().build();
        stage(&a, vec![Change::PutStatement(root.clone())]).await;
        stage(
            &b,
            vec![Change::SetSubscribed {
                context: root.uuid,
                subscribed: true,
            }],
        )
        .await;
        let (sa, sb) = states();
        let (ra, _) = session(&a, &b, MIN_PROTOCOL_VERSION, async {}, (Arc::clone(&sa), Arc::clone(&sb))).await;

        assert_eq!(ra.initial.len(), 2);
        for state in [&sa, &sb] {
            assert!(state.remote().is_empty());
            assert!(state.pending().is_empty());
            assert!(state.commands().is_empty());
            assert_eq!(*state.stage().borrow(), SessionStage::Closed);
        }
    }
}
