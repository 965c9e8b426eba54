//! In-memory implementation of the Store trait.
//!
//! Committed state lives behind a single RwLock. Reads through a
//! transaction look at its staged changes first, newest first, and fall back
//! to committed state. Collection reads merge the staged changes of that one
//! collection over the committed entries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use proofnet_core::{
    DeferredMessage, DelegateTree, Person, SignatureRequest, Statement, StatementAuthority,
    StatementProof, Uuid,
};

use crate::error::{Result, StoreError};
use crate::traits::{Change, CommitEvent, ListenerId, Store, StoreListener, Transaction};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<State>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn StoreListener>)>>,
    next_txn: AtomicU64,
    next_listener: AtomicU64,
}

#[derive(Debug, Clone, Default)]
struct State {
    statements: BTreeMap<Uuid, Statement>,
    subscribed: BTreeSet<Uuid>,
    proof_subscriptions: BTreeSet<Uuid>,
    authorities: BTreeMap<Uuid, StatementAuthority>,
    proofs: BTreeMap<Uuid, StatementProof>,
    persons: BTreeMap<Uuid, Person>,
    delegate_trees: BTreeMap<Uuid, DelegateTree>,
    deferred: BTreeMap<Uuid, DeferredMessage>,
    signature_requests: BTreeMap<Uuid, SignatureRequest>,
}

impl State {
    fn check(&self, change: &Change) -> Result<()> {
        if let Change::PutStatement(statement) = change {
            if let Some(existing) = self.statements.get(&statement.uuid) {
                if existing != statement {
                    return Err(StoreError::Conflict(statement.uuid));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, change: &Change) {
        match change {
            Change::PutStatement(s) => {
                self.statements.entry(s.uuid).or_insert_with(|| s.clone());
            }
            Change::SetSubscribed { context, subscribed } => {
                toggle(&mut self.subscribed, *context, *subscribed);
            }
            Change::SetProofSubscribed { statement, subscribed } => {
                toggle(&mut self.proof_subscriptions, *statement, *subscribed);
            }
            Change::PutAuthority(a) => {
                self.authorities.insert(a.statement, a.clone());
            }
            Change::PutProof(p) => {
                self.proofs.insert(p.statement, p.clone());
            }
            Change::PutPerson(p) => {
                self.persons.insert(p.uuid, p.clone());
            }
            Change::PutDelegateTree(t) => {
                self.delegate_trees.insert(t.root, t.clone());
            }
            Change::PutDeferredMessage(m) => {
                self.deferred.insert(m.uuid, m.clone());
            }
            Change::RemoveDeferredMessage(uuid) => {
                self.deferred.remove(uuid);
            }
            Change::PutSignatureRequest(r) => {
                self.signature_requests.insert(r.uuid, r.clone());
            }
        }
    }
}

fn toggle(set: &mut BTreeSet<Uuid>, uuid: Uuid, on: bool) {
    if on {
        set.insert(uuid);
    } else {
        set.remove(&uuid);
    }
}

/// Committed entries with the staged edits picked by `pick` applied, in key
/// order. An edit of `None` removes the entry.
fn merged<'a, T: Clone + 'a>(
    committed: &BTreeMap<Uuid, T>,
    txn: &'a Transaction,
    pick: impl Fn(&'a Change) -> Option<(Uuid, Option<&'a T>)>,
) -> Vec<T> {
    let edits: BTreeMap<Uuid, Option<&T>> = txn.staged().iter().filter_map(pick).collect();
    if edits.is_empty() {
        return committed.values().cloned().collect();
    }
    let mut view: BTreeMap<Uuid, &T> = committed
        .iter()
        .filter(|(uuid, _)| !edits.contains_key(uuid))
        .map(|(uuid, value)| (*uuid, value))
        .collect();
    view.extend(edits.into_iter().filter_map(|(uuid, value)| value.map(|v| (uuid, v))));
    view.into_values().cloned().collect()
}

/// Committed set with the staged toggles picked by `pick` applied.
fn toggled(
    committed: &BTreeSet<Uuid>,
    txn: &Transaction,
    pick: impl Fn(&Change) -> Option<(Uuid, bool)>,
) -> BTreeSet<Uuid> {
    let mut set = committed.clone();
    for (uuid, on) in txn.staged().iter().filter_map(pick) {
        toggle(&mut set, uuid, on);
    }
    set
}

/// Statements matching `keep`. Committed statements win over staged ones.
fn statements_where<'a>(
    state: &'a State,
    txn: &'a Transaction,
    keep: impl Fn(&Statement) -> bool,
) -> Vec<&'a Statement> {
    let mut found: BTreeMap<Uuid, &Statement> = state
        .statements
        .values()
        .filter(|s| keep(s))
        .map(|s| (s.uuid, s))
        .collect();
    for change in txn.staged() {
        if let Change::PutStatement(s) = change {
            if keep(s) && !state.statements.contains_key(&s.uuid) {
                found.entry(s.uuid).or_insert(s);
            }
        }
    }
    found.into_values().collect()
}

/// Newest staged value matching `pick`, if any.
fn staged<'a, T>(txn: &'a Transaction, pick: impl Fn(&'a Change) -> Option<&'a T>) -> Option<&'a T> {
    txn.staged().iter().rev().find_map(pick)
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(State::default()),
            listeners: RwLock::new(Vec::new()),
            next_txn: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, origin: Option<u64>) -> Result<Transaction> {
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        Ok(Transaction::new(id, origin))
    }

    async fn commit(&self, txn: Transaction) -> Result<CommitEvent> {
        let origin = txn.origin();
        let txn_id = txn.id();
        let changes = txn.into_changes();

        if changes.is_empty() {
            return Ok(CommitEvent { origin, changes });
        }

        {
            let mut state = self.write()?;
            // Validate against committed state plus earlier changes before
            // touching anything, so a failed commit leaves no trace.
            let mut scratch = State {
                statements: state.statements.clone(),
                ..State::default()
            };
            for change in &changes {
                scratch.check(change)?;
                if let Change::PutStatement(_) = change {
                    scratch.apply(change);
                }
            }
            for change in &changes {
                state.apply(change);
            }
        }

        tracing::debug!(txn = txn_id, ?origin, changes = changes.len(), "commit");

        let event = CommitEvent { origin, changes };
        let listeners: Vec<Arc<dyn StoreListener>> = self
            .listeners
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_commit(&event);
        }

        Ok(event)
    }

    async fn abort(&self, txn: Transaction) {
        if !txn.is_empty() {
            tracing::debug!(txn = txn.id(), discarded = txn.staged().len(), "abort");
        }
    }

    fn add_listener(&self, listener: Arc<dyn StoreListener>) -> Result<ListenerId> {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .push((id, listener));
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.listeners
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .retain(|(l, _)| *l != id);
        Ok(())
    }

    async fn statement(&self, txn: &Transaction, uuid: &Uuid) -> Result<Option<Statement>> {
        let state = self.read()?;
        if let Some(s) = state.statements.get(uuid) {
            return Ok(Some(s.clone()));
        }
        Ok(staged(txn, |c| match c {
            Change::PutStatement(s) if &s.uuid == uuid => Some(s),
            _ => None,
        })
        .cloned())
    }

    async fn statements_in_context(
        &self,
        txn: &Transaction,
        context: &Uuid,
    ) -> Result<Vec<Statement>> {
        let state = self.read()?;
        Ok(statements_where(&state, txn, |s| s.context.as_ref() == Some(context))
            .into_iter()
            .cloned()
            .collect())
    }

    async fn root_contexts(&self, txn: &Transaction) -> Result<Vec<Uuid>> {
        let state = self.read()?;
        Ok(statements_where(&state, txn, Statement::is_root_context)
            .into_iter()
            .map(|s| s.uuid)
            .collect())
    }

    async fn subscribed_contexts(&self, txn: &Transaction) -> Result<BTreeSet<Uuid>> {
        let state = self.read()?;
        Ok(toggled(&state.subscribed, txn, |c| match c {
            Change::SetSubscribed { context, subscribed } => Some((*context, *subscribed)),
            _ => None,
        }))
    }

    async fn proof_subscriptions(&self, txn: &Transaction) -> Result<BTreeSet<Uuid>> {
        let state = self.read()?;
        Ok(toggled(&state.proof_subscriptions, txn, |c| match c {
            Change::SetProofSubscribed { statement, subscribed } => Some((*statement, *subscribed)),
            _ => None,
        }))
    }

    async fn authority(
        &self,
        txn: &Transaction,
        statement: &Uuid,
    ) -> Result<Option<StatementAuthority>> {
        if let Some(a) = staged(txn, |c| match c {
            Change::PutAuthority(a) if &a.statement == statement => Some(a),
            _ => None,
        }) {
            return Ok(Some(a.clone()));
        }
        Ok(self.read()?.authorities.get(statement).cloned())
    }

    async fn proof(&self, txn: &Transaction, statement: &Uuid) -> Result<Option<StatementProof>> {
        if let Some(p) = staged(txn, |c| match c {
            Change::PutProof(p) if &p.statement == statement => Some(p),
            _ => None,
        }) {
            return Ok(Some(p.clone()));
        }
        Ok(self.read()?.proofs.get(statement).cloned())
    }

    async fn person(&self, txn: &Transaction, uuid: &Uuid) -> Result<Option<Person>> {
        if let Some(p) = staged(txn, |c| match c {
            Change::PutPerson(p) if &p.uuid == uuid => Some(p),
            _ => None,
        }) {
            return Ok(Some(p.clone()));
        }
        Ok(self.read()?.persons.get(uuid).cloned())
    }

    async fn persons(&self, txn: &Transaction) -> Result<Vec<Person>> {
        let state = self.read()?;
        Ok(merged(&state.persons, txn, |c| match c {
            Change::PutPerson(p) => Some((p.uuid, Some(p))),
            _ => None,
        }))
    }

    async fn delegate_tree(&self, txn: &Transaction, root: &Uuid) -> Result<Option<DelegateTree>> {
        if let Some(t) = staged(txn, |c| match c {
            Change::PutDelegateTree(t) if &t.root == root => Some(t),
            _ => None,
        }) {
            return Ok(Some(t.clone()));
        }
        Ok(self.read()?.delegate_trees.get(root).cloned())
    }

    async fn delegate_trees(&self, txn: &Transaction) -> Result<Vec<DelegateTree>> {
        let state = self.read()?;
        Ok(merged(&state.delegate_trees, txn, |c| match c {
            Change::PutDelegateTree(t) => Some((t.root, Some(t))),
            _ => None,
        }))
    }

    async fn deferred_messages(&self, txn: &Transaction) -> Result<Vec<DeferredMessage>> {
        let state = self.read()?;
        Ok(merged(&state.deferred, txn, |c| match c {
            Change::PutDeferredMessage(m) => Some((m.uuid, Some(m))),
            Change::RemoveDeferredMessage(uuid) => Some((*uuid, None)),
            _ => None,
        }))
    }

    async fn signature_request(
        &self,
        txn: &Transaction,
        uuid: &Uuid,
    ) -> Result<Option<SignatureRequest>> {
        if let Some(r) = staged(txn, |c| match c {
            Change::PutSignatureRequest(r) if &r.uuid == uuid => Some(r),
            _ => None,
        }) {
            return Ok(Some(r.clone()));
        }
        Ok(self.read()?.signature_requests.get(uuid).cloned())
    }

    async fn signature_requests(&self, txn: &Transaction) -> Result<Vec<SignatureRequest>> {
        let state = self.read()?;
        Ok(merged(&state.signature_requests, txn, |c| match c {
            Change::PutSignatureRequest(r) => Some((r.uuid, Some(r))),
            _ => None,
        }))
    }
}
