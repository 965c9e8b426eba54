//! Resources: typed units of shared state exchanged with a metadata round.
//!
//! An exchange is symmetric and runs in lockstep on both sides:
//!
//! ```text
//!   ResourceAdvertise  (resource, metadata) for everything offered
//!   ResourceRequest    resources whose metadata says the peer's copy is newer
//!   ResourceResponse   payloads for the peer's request
//! ```
//!
//! Received payloads are verified before anything is staged. A payload that
//! fails verification fails the whole exchange.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use proofnet_core::{
    verify_transfer, DelegateTree, Ed25519PublicKey, Person, PersonInfoVersion,
    StatementAuthority, StatementProof, Uuid, ValidationError,
};
use proofnet_store::{Change, Store, Transaction};

use crate::dialog::Dialog;
use crate::error::{Result, SyncError};
use crate::wire::{ResourceAdvertise, ResourceRequest, ResourceResponse};

/// Kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Signatures on a root context.
    RootContextSignature,
    /// Declaration of interest in a context's statements.
    SubscribedStatements,
    /// Declaration of interest in a statement's proof.
    SubscribedProofs,
    /// A statement's proof with its signatures.
    StatementProof,
    Person,
    /// Delegate tree of a root context, keyed by the root.
    DelegateTree,
}

/// A resource identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceType,
    pub uuid: Uuid,
}

impl Resource {
    pub fn new(kind: ResourceType, uuid: Uuid) -> Self {
        Self { kind, uuid }
    }
}

/// What the advertiser holds, enough for the peer to decide whether to ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metadata {
    /// `(authorizer, signed_at)` per signature.
    Authority { signatures: Vec<(Uuid, i64)> },
    /// `provided`: the advertiser holds the entity. `subscribed`: it wants it.
    Subscription { provided: bool, subscribed: bool },
    Proof {
        signed_proof: bool,
        signatures: Vec<(Uuid, i64)>,
    },
    Person(PersonInfoVersion),
    DelegateTree { signed_at: i64 },
}

/// The transferred content of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourcePayload {
    Authority {
        authority: StatementAuthority,
        /// Persons behind the signatures, as far as the sender knows them.
        signers: Vec<Person>,
    },
    Proof {
        proof: StatementProof,
        authority: Option<StatementAuthority>,
        signers: Vec<Person>,
    },
    Person(Person),
    DelegateTree { tree: DelegateTree, signer: Person },
}

impl ResourcePayload {
    /// The resource this payload answers.
    pub fn resource(&self) -> Resource {
        match self {
            ResourcePayload::Authority { authority, .. } => {
                Resource::new(ResourceType::RootContextSignature, authority.statement)
            }
            ResourcePayload::Proof { proof, .. } => {
                Resource::new(ResourceType::StatementProof, proof.statement)
            }
            ResourcePayload::Person(person) => Resource::new(ResourceType::Person, person.uuid),
            ResourcePayload::DelegateTree { tree, .. } => {
                Resource::new(ResourceType::DelegateTree, tree.root)
            }
        }
    }
}

/// Result of [`exchange_resources`].
#[derive(Debug, Clone, Default)]
pub struct ExchangeOutcome {
    /// Everything the peer advertised.
    pub advertised: Vec<(Resource, Metadata)>,
    /// Payloads staged into the transaction.
    pub integrated: usize,
}

impl ExchangeOutcome {
    /// Uuids the peer advertised with `kind` and, for declarations, with
    /// the subscribed flag set.
    pub fn declared(&self, kind: ResourceType) -> BTreeSet<Uuid> {
        self.advertised
            .iter()
            .filter(|(resource, metadata)| {
                resource.kind == kind
                    && !matches!(metadata, Metadata::Subscription { subscribed: false, .. })
            })
            .map(|(resource, _)| resource.uuid)
            .collect()
    }
}

/// Run one advertise/request/respond round over `offered`.
pub async fn exchange_resources(
    dialog: &mut Dialog<'_>,
    store: &dyn Store,
    txn: &mut Transaction,
    offered: &[Resource],
) -> Result<ExchangeOutcome> {
    let mut entries = Vec::with_capacity(offered.len());
    for resource in offered {
        if let Some(metadata) = metadata_for(store, txn, resource).await? {
            entries.push((*resource, metadata));
        }
    }
    let served: BTreeSet<Resource> = entries.iter().map(|(r, _)| *r).collect();
    dialog.send(&ResourceAdvertise { entries })?;

    let advertised = dialog.recv::<ResourceAdvertise>().await?.entries;
    let mut wanted = Vec::new();
    for (resource, metadata) in &advertised {
        if wants(store, txn, resource, metadata).await? {
            wanted.push(*resource);
        }
    }
    dialog.send(&ResourceRequest {
        resources: wanted.clone(),
    })?;

    let request = dialog.recv::<ResourceRequest>().await?;
    let mut payloads = Vec::with_capacity(request.resources.len());
    for resource in &request.resources {
        if !served.contains(resource) {
            return Err(SyncError::InvalidMessage(format!(
                "peer requested {:?} {} which was not advertised",
                resource.kind, resource.uuid
            )));
        }
        if let Some(payload) = payload_for(store, txn, resource).await? {
            payloads.push(payload);
        }
    }
    dialog.send(&ResourceResponse { payloads })?;

    let response = dialog.recv::<ResourceResponse>().await?;
    let wanted: BTreeSet<Resource> = wanted.into_iter().collect();
    let mut integrated = 0;
    for payload in &response.payloads {
        if !wanted.contains(&payload.resource()) {
            return Err(SyncError::InvalidMessage(format!(
                "unrequested payload for {}",
                payload.resource().uuid
            )));
        }
        if integrate(store, txn, payload).await? {
            integrated += 1;
        }
    }

    tracing::debug!(
        conn = %dialog.connection_id(),
        offered = served.len(),
        requested = wanted.len(),
        integrated,
        "resource exchange complete"
    );
    Ok(ExchangeOutcome {
        advertised,
        integrated,
    })
}

/// Local metadata for `resource`, or `None` if there is nothing to offer.
pub async fn metadata_for(
    store: &dyn Store,
    txn: &Transaction,
    resource: &Resource,
) -> Result<Option<Metadata>> {
    let uuid = &resource.uuid;
    let metadata = match resource.kind {
        ResourceType::RootContextSignature => store
            .authority(txn, uuid)
            .await?
            .map(|a| Metadata::Authority {
                signatures: signature_versions(&a),
            }),
        ResourceType::SubscribedStatements => Some(Metadata::Subscription {
            provided: store.has_statement(txn, uuid).await?,
            subscribed: store.subscribed_contexts(txn).await?.contains(uuid),
        }),
        ResourceType::SubscribedProofs => Some(Metadata::Subscription {
            provided: store.proof(txn, uuid).await?.is_some(),
            subscribed: store.proof_subscriptions(txn).await?.contains(uuid),
        }),
        ResourceType::StatementProof => match store.proof(txn, uuid).await? {
            Some(_) => {
                let authority = store.authority(txn, uuid).await?;
                Some(Metadata::Proof {
                    signed_proof: authority.as_ref().is_some_and(|a| a.signed_proof()),
                    signatures: authority.as_ref().map(signature_versions).unwrap_or_default(),
                })
            }
            None => None,
        },
        ResourceType::Person => store.person(txn, uuid).await?.map(|p| Metadata::Person(p.version())),
        ResourceType::DelegateTree => store
            .delegate_tree(txn, uuid)
            .await?
            .map(|t| Metadata::DelegateTree {
                signed_at: t.signed_at,
            }),
    };
    Ok(metadata)
}

/// Whether the peer's copy of `resource`, described by `metadata`, is worth
/// requesting.
pub async fn wants(
    store: &dyn Store,
    txn: &Transaction,
    resource: &Resource,
    metadata: &Metadata,
) -> Result<bool> {
    let uuid = &resource.uuid;
    let wanted = match (resource.kind, metadata) {
        (ResourceType::RootContextSignature, Metadata::Authority { signatures }) => {
            store.has_statement(txn, uuid).await?
                && has_newer(store.authority(txn, uuid).await?.as_ref(), signatures)
        }
        (ResourceType::StatementProof, Metadata::Proof { signatures, .. }) => {
            store.has_statement(txn, uuid).await?
                && (store.proof(txn, uuid).await?.is_none()
                    || has_newer(store.authority(txn, uuid).await?.as_ref(), signatures))
        }
        (ResourceType::Person, Metadata::Person(version)) => match store.person(txn, uuid).await? {
            Some(local) => version.supersedes(&local.version()),
            None => true,
        },
        (ResourceType::DelegateTree, Metadata::DelegateTree { signed_at }) => {
            store.has_statement(txn, uuid).await?
                && store
                    .delegate_tree(txn, uuid)
                    .await?
                    .map_or(true, |local| *signed_at > local.signed_at)
        }
        (ResourceType::SubscribedStatements | ResourceType::SubscribedProofs, Metadata::Subscription { .. }) => {
            false
        }
        (kind, metadata) => {
            return Err(SyncError::InvalidMessage(format!(
                "metadata {metadata:?} does not describe a {kind:?} resource"
            )))
        }
    };
    Ok(wanted)
}

/// Build the payload for `resource`.
pub async fn payload_for(
    store: &dyn Store,
    txn: &Transaction,
    resource: &Resource,
) -> Result<Option<ResourcePayload>> {
    let uuid = &resource.uuid;
    let payload = match resource.kind {
        ResourceType::RootContextSignature => match store.authority(txn, uuid).await? {
            Some(authority) => {
                let signers = signers_of(store, txn, &authority).await?;
                Some(ResourcePayload::Authority { authority, signers })
            }
            None => None,
        },
        ResourceType::StatementProof => match store.proof(txn, uuid).await? {
            Some(proof) => {
                let authority = store.authority(txn, uuid).await?;
                let signers = match &authority {
                    Some(a) => signers_of(store, txn, a).await?,
                    None => Vec::new(),
                };
                Some(ResourcePayload::Proof {
                    proof,
                    authority,
                    signers,
                })
            }
            None => None,
        },
        ResourceType::Person => store.person(txn, uuid).await?.map(ResourcePayload::Person),
        ResourceType::DelegateTree => match store.delegate_tree(txn, uuid).await? {
            Some(tree) => store
                .person(txn, &tree.signer)
                .await?
                .map(|signer| ResourcePayload::DelegateTree { tree, signer }),
            None => None,
        },
        ResourceType::SubscribedStatements | ResourceType::SubscribedProofs => None,
    };
    Ok(payload)
}

/// Verify a received payload and stage it. Returns false if it was skipped
/// because something it depends on is missing locally or it changed nothing.
pub async fn integrate(store: &dyn Store, txn: &mut Transaction, payload: &ResourcePayload) -> Result<bool> {
    match payload {
        ResourcePayload::Authority { authority, signers } => {
            let Some(statement) = store.statement(txn, &authority.statement).await? else {
                tracing::debug!(statement = %authority.statement, "skipping signatures of unknown statement");
                return Ok(false);
            };
            if statement.context != authority.context {
                return Err(ValidationError::AuthorityMismatch(authority.statement).into());
            }
            verify_signed(store, txn, Some(authority), signers).await?;
            merge_signers(store, txn, signers).await?;
            merge_authority(store, txn, authority).await
        }
        ResourcePayload::Proof {
            proof,
            authority,
            signers,
        } => {
            let Some(statement) = store.statement(txn, &proof.statement).await? else {
                tracing::debug!(statement = %proof.statement, "skipping proof of unknown statement");
                return Ok(false);
            };
            for dependency in &proof.dependencies {
                if !store.has_statement(txn, dependency).await? {
                    tracing::debug!(
                        statement = %proof.statement,
                        missing = %dependency,
                        "skipping proof with missing dependency"
                    );
                    return Ok(false);
                }
            }
            if let Some(authority) = authority {
                if authority.statement != proof.statement || authority.context != statement.context {
                    return Err(ValidationError::AuthorityMismatch(proof.statement).into());
                }
            }
            verify_signed(store, txn, authority.as_ref(), signers).await?;
            merge_signers(store, txn, signers).await?;

            let mut changed = false;
            if store.proof(txn, &proof.statement).await?.is_none() {
                txn.stage(Change::PutProof(proof.clone()));
                changed = true;
            }
            if let Some(authority) = authority {
                changed |= merge_authority(store, txn, authority).await?;
            }
            Ok(changed)
        }
        ResourcePayload::Person(person) => {
            verify_signed(store, txn, None, std::slice::from_ref(person)).await?;
            merge_person(store, txn, person).await
        }
        ResourcePayload::DelegateTree { tree, signer } => {
            if signer.uuid != tree.signer {
                return Err(SyncError::InvalidMessage(format!(
                    "delegate tree of {} delivered with the wrong signer",
                    tree.root
                )));
            }
            if !store.has_statement(txn, &tree.root).await? {
                tracing::debug!(root = %tree.root, "skipping delegate tree of unknown root");
                return Ok(false);
            }
            verify_signed(store, txn, None, std::slice::from_ref(signer)).await?;
            tree.verify(&signer.public_key)?;
            merge_person(store, txn, signer).await?;
            match store.delegate_tree(txn, &tree.root).await? {
                Some(local) if !tree.supersedes(&local) => Ok(false),
                _ => {
                    txn.stage(Change::PutDelegateTree(tree.clone()));
                    Ok(true)
                }
            }
        }
    }
}

/// Keys already known locally for `uuids`.
pub(crate) async fn known_keys(
    store: &dyn Store,
    txn: &Transaction,
    uuids: impl IntoIterator<Item = Uuid>,
) -> Result<HashMap<Uuid, Ed25519PublicKey>> {
    let mut keys = HashMap::new();
    for uuid in uuids {
        if keys.contains_key(&uuid) {
            continue;
        }
        if let Some(person) = store.person(txn, &uuid).await? {
            keys.insert(uuid, person.public_key);
        }
    }
    Ok(keys)
}

/// Persons needed to verify the signatures of `authority`, as far as they
/// are known locally.
pub(crate) async fn signers_of(
    store: &dyn Store,
    txn: &Transaction,
    authority: &StatementAuthority,
) -> Result<Vec<Person>> {
    let mut signers = Vec::new();
    let uuids: BTreeSet<Uuid> = authority.signatures.iter().map(|s| s.authorizer).collect();
    for uuid in uuids {
        if let Some(person) = store.person(txn, &uuid).await? {
            signers.push(person);
        }
    }
    Ok(signers)
}

/// Stage `person`, or its newer info over the local record.
pub(crate) async fn merge_person(store: &dyn Store, txn: &mut Transaction, person: &Person) -> Result<bool> {
    match store.person(txn, &person.uuid).await? {
        None => {
            txn.stage(Change::PutPerson(person.clone()));
            Ok(true)
        }
        Some(mut local) => {
            if local.apply(person)? {
                txn.stage(Change::PutPerson(local));
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

async fn merge_signers(store: &dyn Store, txn: &mut Transaction, signers: &[Person]) -> Result<()> {
    for signer in signers {
        merge_person(store, txn, signer).await?;
    }
    Ok(())
}

pub(crate) async fn merge_authority(
    store: &dyn Store,
    txn: &mut Transaction,
    received: &StatementAuthority,
) -> Result<bool> {
    match store.authority(txn, &received.statement).await? {
        None => {
            txn.stage(Change::PutAuthority(received.clone()));
            Ok(true)
        }
        Some(mut local) => {
            if local.merge(received) {
                txn.stage(Change::PutAuthority(local));
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

async fn verify_signed(
    store: &dyn Store,
    txn: &Transaction,
    authority: Option<&StatementAuthority>,
    persons: &[Person],
) -> Result<()> {
    let uuids = persons
        .iter()
        .map(|p| p.uuid)
        .chain(authority.into_iter().flat_map(|a| a.signatures.iter().map(|s| s.authorizer)));
    let known = known_keys(store, txn, uuids.collect::<Vec<_>>()).await?;
    let authorities = match authority {
        Some(a) => std::slice::from_ref(a),
        None => &[],
    };
    verify_transfer(&[], authorities, persons, |uuid| known.get(uuid).copied())?;
    Ok(())
}

fn signature_versions(authority: &StatementAuthority) -> Vec<(Uuid, i64)> {
    authority
        .signatures
        .iter()
        .map(|s| (s.authorizer, s.signed_at))
        .collect()
}

/// Whether `advertised` carries a signature `local` lacks or holds older.
fn has_newer(local: Option<&StatementAuthority>, advertised: &[(Uuid, i64)]) -> bool {
    let Some(local) = local else {
        return !advertised.is_empty();
    };
    advertised
        .iter()
        .any(|(authorizer, at)| local.signature_of(authorizer).map_or(true, |s| *at > s.signed_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use proofnet_core::{Keypair, PersonDetails, StatementBuilder, StatementKind};
    use proofnet_store::MemoryStore;

    use crate::connection::{pipe, Connection, ConnectionId};
    use crate::wire::PROTOCOL_VERSION;

    async fn seed(store: &MemoryStore, changes: Vec<Change>) {
        let mut txn = store.begin(None).await.unwrap();
        for change in changes {
            txn.stage(change);
        }
        store.commit(txn).await.unwrap();
    }

    async fn exchange(
        conn: &mut Connection,
        store: &MemoryStore,
        offered: Vec<Resource>,
    ) -> Result<ExchangeOutcome> {
        let mut txn = store.begin(Some(conn.id().0)).await?;
        let mut dialog = Dialog::open(conn, Duration::from_secs(5), PROTOCOL_VERSION)?;
        let outcome = exchange_resources(&mut dialog, store, &mut txn, &offered).await;
        dialog.close().await?;
        match outcome {
            Ok(outcome) => {
                store.commit(txn).await?;
                Ok(outcome)
            }
            Err(e) => {
                store.abort(txn).await;
                Err(e)
            }
        }
    }

    fn person(seed: u8, at: i64, nick: &str) -> (Keypair, Person) {
        let kp = Keypair::from_seed(&[seed; 32]);
        let person = Person::signed(Uuid::from_bytes([seed; 16]), &kp, PersonDetails::nick(nick), at);
        (kp, person)
    }

    #[tokio::test]
    async fn test_newer_person_replaces_older() {
        let (a, b) = (MemoryStore::new(), MemoryStore::new());
        let (_, old) = person(1, 10, "old");
        let (_, new) = person(1, 20, "new");
        seed(&a, vec![Change::PutPerson(new.clone())]).await;
        seed(&b, vec![Change::PutPerson(old.clone())]).await;

        let (mut ca, mut cb) = pipe(ConnectionId(1), ConnectionId(2), 1 << 20);
        let offer = vec![Resource::new(ResourceType::Person, new.uuid)];
        let (ra, rb) = tokio::join!(exchange(&mut ca, &a, offer.clone()), exchange(&mut cb, &b, offer));
        assert_eq!(ra.unwrap().integrated, 0);
        assert_eq!(rb.unwrap().integrated, 1);

        let txn = b.begin(None).await.unwrap();
        assert_eq!(b.person(&txn, &new.uuid).await.unwrap().unwrap(), new);
    }

    #[tokio::test]
    async fn test_root_signatures_merge() {
        let (a, b) = (MemoryStore::new(), MemoryStore::new());
        let root = StatementBuilder::root_context().build();
        let (kp1, p1) = person(1, 1, "one");
        let (kp2, p2) = person(2, 1, "two");

        let mut on_a = StatementAuthority::new(root.uuid, None, p1.uuid, 1);
        on_a.sign(p1.uuid, &kp1, 5, false);
        on_a.sign(p2.uuid, &kp2, 6, false);
        let mut on_b = StatementAuthority::new(root.uuid, None, p1.uuid, 1);
        on_b.sign(p1.uuid, &kp1, 5, false);

        seed(
            &a,
            vec![
                Change::PutStatement(root.clone()),
                Change::PutPerson(p1.clone()),
                Change::PutPerson(p2.clone()),
                Change::PutAuthority(on_a),
            ],
        )
        .await;
        seed(
            &b,
            vec![
                Change::PutStatement(root.clone()),
                Change::PutPerson(p1),
                Change::PutAuthority(on_b),
            ],
        )
        .await;

        let (mut ca, mut cb) = pipe(ConnectionId(1), ConnectionId(2), 1 << 20);
        let offer = vec![Resource::new(ResourceType::RootContextSignature, root.uuid)];
        let (ra, rb) = tokio::join!(exchange(&mut ca, &a, offer.clone()), exchange(&mut cb, &b, offer));
        ra.unwrap();
        assert_eq!(rb.unwrap().integrated, 1);

        let txn = b.begin(None).await.unwrap();
        let merged = b.authority(&txn, &root.uuid).await.unwrap().unwrap();
        assert_eq!(merged.signatures.len(), 2);
        assert!(b.person(&txn, &p2.uuid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forged_payload_rejected() {
        let (a, b) = (MemoryStore::new(), MemoryStore::new());
        let (_, mut forged) = person(1, 50, "mallory");
        if let proofnet_core::PersonInfo::Signed { details, .. } = &mut forged.info {
            details.nick = "alice".into();
        }
        seed(&a, vec![Change::PutPerson(forged.clone())]).await;

        let (mut ca, mut cb) = pipe(ConnectionId(1), ConnectionId(2), 1 << 20);
        let offer = vec![Resource::new(ResourceType::Person, forged.uuid)];
        let (_, rb) = tokio::join!(exchange(&mut ca, &a, offer), exchange(&mut cb, &b, vec![]));
        assert!(matches!(rb, Err(SyncError::Validation(_))));
        let txn = b.begin(None).await.unwrap();
        assert!(b.person(&txn, &forged.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_declarations_are_never_requested() {
        let (a, b) = (MemoryStore::new(), MemoryStore::new());
        let context = StatementBuilder::root_context().build();
        seed(
            &a,
            vec![
                Change::PutStatement(context.clone()),
                Change::SetSubscribed {
                    context: context.uuid,
                    subscribed: true,
                },
            ],
        )
        .await;
        let (mut ca, mut cb) = pipe(ConnectionId(1), ConnectionId(2), 1 << 20);
        let offer = vec![Resource::new(ResourceType::SubscribedStatements, context.uuid)];
        let (_, rb) = tokio::join!(exchange(&mut ca, &a, offer), exchange(&mut cb, &b, vec![]));
        let outcome = rb.unwrap();
        assert_eq!(outcome.integrated, 0);
        assert_eq!(
            outcome.declared(ResourceType::SubscribedStatements),
            BTreeSet::from([context.uuid])
        );
    }

    #[tokio::test]
    async fn test_proof_skipped_without_dependencies() {
        let (a, b) = (MemoryStore::new(), MemoryStore::new());
        let root = StatementBuilder::root_context().build();
        let lemma = StatementBuilder::new(StatementKind::Axiom).context(root.uuid).build();
        let theorem = StatementBuilder::new(StatementKind::Declaration)
            .context(root.uuid)
            .build();
        let proof = StatementProof::new(theorem.uuid, vec![lemma.uuid], b"qed".to_vec());
        seed(
            &a,
            vec![
                Change::PutStatement(root.clone()),
                Change::PutStatement(lemma),
                Change::PutStatement(theorem.clone()),
                Change::PutProof(proof),
            ],
        )
        .await;
        seed(
            &b,
            vec![Change::PutStatement(root), Change::PutStatement(theorem.clone())],
        )
        .await;

        let store_b: Arc<MemoryStore> = Arc::new(b);
        let (mut ca, mut cb) = pipe(ConnectionId(1), ConnectionId(2), 1 << 20);
        let offer = vec![Resource::new(ResourceType::StatementProof, theorem.uuid)];
        let (_, rb) = tokio::join!(exchange(&mut ca, &a, offer), exchange(&mut cb, &store_b, vec![]));
        assert_eq!(rb.unwrap().integrated, 0);
        let txn = store_b.begin(None).await.unwrap();
        assert!(store_b.proof(&txn, &theorem.uuid).await.unwrap().is_none());
    }
}
