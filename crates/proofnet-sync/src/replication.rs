//! Dependency-ordered statement replication.
//!
//! Both sides offer a set of statement uuids, request what they lack from
//! the other's offer, and answer the other's request with the statements in
//! dependency order: a statement is sent only after every requested
//! statement it depends on and after its requested containing context.
//!
//! The receiver checks the order. Every reference of a received statement
//! must already be in the store or earlier in the same response.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use proofnet_core::{verify_transfer, Statement, StatementAuthority, Uuid, ValidationError};
use proofnet_store::{Change, Store, Transaction};

use crate::dialog::Dialog;
use crate::error::{Result, SyncError};
use crate::resource::{known_keys, merge_authority, merge_person, signers_of};
use crate::wire::{StatementOffer, StatementRequest, StatementResponse};

/// Order `pending` so every element follows the elements of `pending` it
/// references.
///
/// Iterative post-order depth-first search over the subgraph induced by
/// `pending`. A visit stack holds `(uuid, expanded)` entries; the path set
/// holds statements expanded but not yet emitted, so meeting one of them
/// again means a cycle.
pub fn dependency_order<F, I>(pending: &BTreeSet<Uuid>, references: F) -> Result<Vec<Uuid>>
where
    F: Fn(&Uuid) -> I,
    I: IntoIterator<Item = Uuid>,
{
    let mut ordered = Vec::with_capacity(pending.len());
    let mut emitted: HashSet<Uuid> = HashSet::with_capacity(pending.len());
    let mut on_path: HashSet<Uuid> = HashSet::new();
    let mut stack: Vec<(Uuid, bool)> = Vec::new();

    for start in pending {
        if emitted.contains(start) {
            continue;
        }
        stack.push((*start, false));
        while let Some((uuid, expanded)) = stack.pop() {
            if expanded {
                on_path.remove(&uuid);
                if emitted.insert(uuid) {
                    ordered.push(uuid);
                }
                continue;
            }
            if emitted.contains(&uuid) {
                continue;
            }
            if !on_path.insert(uuid) {
                return Err(SyncError::Internal(format!("dependency cycle through {uuid}")));
            }
            stack.push((uuid, true));
            for reference in references(&uuid) {
                if pending.contains(&reference) && !emitted.contains(&reference) {
                    stack.push((reference, false));
                }
            }
        }
    }
    Ok(ordered)
}

/// Every locally held statement inside `contexts`, nested contexts
/// included, plus everything those statements reference.
pub async fn offer_closure(
    store: &dyn Store,
    txn: &Transaction,
    contexts: &BTreeSet<Uuid>,
) -> Result<BTreeSet<Uuid>> {
    let mut found = BTreeSet::new();
    let mut queue: VecDeque<Uuid> = VecDeque::new();
    for context in contexts {
        if store.has_statement(txn, context).await? {
            found.insert(*context);
            queue.push_back(*context);
        }
    }
    while let Some(context) = queue.pop_front() {
        for statement in store.statements_in_context(txn, &context).await? {
            if found.insert(statement.uuid) && statement.is_context() {
                queue.push_back(statement.uuid);
            }
        }
    }
    reference_closure(store, txn, found).await
}

/// `seeds` plus every locally held statement they transitively reference.
/// Does not descend into context contents.
pub async fn reference_closure(
    store: &dyn Store,
    txn: &Transaction,
    seeds: impl IntoIterator<Item = Uuid>,
) -> Result<BTreeSet<Uuid>> {
    let mut closure = BTreeSet::new();
    let mut queue: VecDeque<Uuid> = seeds.into_iter().collect();
    while let Some(uuid) = queue.pop_front() {
        if closure.contains(&uuid) {
            continue;
        }
        let Some(statement) = store.statement(txn, &uuid).await? else {
            continue;
        };
        closure.insert(uuid);
        queue.extend(statement.references().filter(|r| !closure.contains(r)));
    }
    Ok(closure)
}

/// Result of [`exchange_statements`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationOutcome {
    /// How many statements the peer requested from us.
    pub served: usize,
    /// Statements staged from the peer's response.
    pub received: Vec<Uuid>,
}

/// Offer `offer` to the peer and integrate what it offers back.
pub async fn exchange_statements(
    dialog: &mut Dialog<'_>,
    store: &dyn Store,
    txn: &mut Transaction,
    offer: BTreeSet<Uuid>,
) -> Result<ReplicationOutcome> {
    dialog.send(&StatementOffer {
        uuids: offer.clone(),
    })?;

    let theirs = dialog.recv::<StatementOffer>().await?.uuids;
    let mut missing = BTreeSet::new();
    for uuid in theirs {
        if !store.has_statement(txn, &uuid).await? {
            missing.insert(uuid);
        }
    }
    dialog.send(&StatementRequest {
        uuids: missing.clone(),
    })?;

    let request = dialog.recv::<StatementRequest>().await?.uuids;
    if let Some(stray) = request.iter().find(|u| !offer.contains(u)) {
        return Err(SyncError::InvalidMessage(format!(
            "peer requested statement {stray} which was not offered"
        )));
    }
    let served = request.len();
    let response = build_response(store, txn, &request).await?;
    dialog.send(&response)?;

    let response = dialog.recv::<StatementResponse>().await?;
    let received = integrate_response(store, txn, &missing, response).await?;

    tracing::debug!(
        conn = %dialog.connection_id(),
        offered = offer.len(),
        served,
        received = received.len(),
        "statement exchange complete"
    );
    Ok(ReplicationOutcome { served, received })
}

async fn build_response(
    store: &dyn Store,
    txn: &Transaction,
    request: &BTreeSet<Uuid>,
) -> Result<StatementResponse> {
    let mut statements: BTreeMap<Uuid, Statement> = BTreeMap::new();
    for uuid in request {
        let statement = store
            .statement(txn, uuid)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("offered statement {uuid} vanished")))?;
        statements.insert(*uuid, statement);
    }

    let order = dependency_order(request, |uuid| {
        statements
            .get(uuid)
            .map(|s| s.references().collect::<Vec<_>>())
            .unwrap_or_default()
    })?;

    let mut authorities = Vec::new();
    let mut persons = BTreeMap::new();
    for uuid in &order {
        if let Some(authority) = store.authority(txn, uuid).await? {
            for person in signers_of(store, txn, &authority).await? {
                persons.insert(person.uuid, person);
            }
            authorities.push(authority);
        }
    }

    let ordered = order
        .iter()
        .filter_map(|uuid| statements.remove(uuid))
        .collect();
    Ok(StatementResponse {
        statements: ordered,
        authorities,
        persons: persons.into_values().collect(),
    })
}

/// Verify a response against our request and stage it.
async fn integrate_response(
    store: &dyn Store,
    txn: &mut Transaction,
    requested: &BTreeSet<Uuid>,
    response: StatementResponse,
) -> Result<Vec<Uuid>> {
    let mut seen = HashSet::with_capacity(response.statements.len());
    for statement in &response.statements {
        if !requested.contains(&statement.uuid) || !seen.insert(statement.uuid) {
            return Err(SyncError::InvalidMessage(format!(
                "unrequested or repeated statement {}",
                statement.uuid
            )));
        }
    }
    if let Some(stray) = response
        .authorities
        .iter()
        .find(|a| !seen.contains(&a.statement))
    {
        return Err(SyncError::InvalidMessage(format!(
            "authority for statement {} outside the response",
            stray.statement
        )));
    }

    let signer_uuids = response
        .persons
        .iter()
        .map(|p| p.uuid)
        .chain(signers(&response.authorities));
    let known = known_keys(store, txn, signer_uuids.collect::<Vec<_>>()).await?;
    verify_transfer(
        &response.statements,
        &response.authorities,
        &response.persons,
        |uuid| known.get(uuid).copied(),
    )?;

    let mut earlier = HashSet::with_capacity(response.statements.len());
    for statement in &response.statements {
        for reference in statement.references() {
            if !earlier.contains(&reference) && !store.has_statement(txn, &reference).await? {
                return Err(ValidationError::MissingDependency {
                    statement: statement.uuid,
                    missing: reference,
                }
                .into());
            }
        }
        earlier.insert(statement.uuid);
        txn.stage(Change::PutStatement(statement.clone()));
    }

    for person in &response.persons {
        merge_person(store, txn, person).await?;
    }
    for authority in &response.authorities {
        merge_authority(store, txn, authority).await?;
    }
    Ok(response.statements.into_iter().map(|s| s.uuid).collect())
}

fn signers(authorities: &[StatementAuthority]) -> impl Iterator<Item = Uuid> + '_ {
    authorities
        .iter()
        .flat_map(|a| a.signatures.iter().map(|s| s.authorizer))
}
