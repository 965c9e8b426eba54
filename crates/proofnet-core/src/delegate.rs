//! Delegate trees: who may sign on behalf of a root context's author, per
//! identifier namespace prefix.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::{delegate_tree_signing_bytes, domains};
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::ValidationError;

/// The signed delegate map of one root context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateTree {
    /// The root context this tree belongs to.
    pub root: Uuid,
    /// Person who signed the tree (the root context's author).
    pub signer: Uuid,
    pub signed_at: i64,
    /// Namespace prefix -> delegated persons.
    pub delegates: BTreeMap<String, BTreeSet<Uuid>>,
    pub signature: Ed25519Signature,
}

impl DelegateTree {
    /// Build and sign a tree.
    pub fn sign(
        root: Uuid,
        signer: Uuid,
        keypair: &Keypair,
        delegates: BTreeMap<String, BTreeSet<Uuid>>,
        signed_at: i64,
    ) -> Self {
        let bytes = delegate_tree_signing_bytes(&root, &signer, signed_at, &delegates);
        let signature = keypair.sign_domain(domains::DELEGATE_TREE, &bytes);
        Self {
            root,
            signer,
            signed_at,
            delegates,
            signature,
        }
    }

    /// Whether this tree replaces `current`. Strictly newer only.
    pub fn supersedes(&self, current: &DelegateTree) -> bool {
        self.root == current.root && self.signed_at > current.signed_at
    }

    /// Verify against the signer's key.
    pub fn verify(&self, signer_key: &Ed25519PublicKey) -> Result<(), ValidationError> {
        let bytes =
            delegate_tree_signing_bytes(&self.root, &self.signer, self.signed_at, &self.delegates);
        signer_key
            .verify_domain(domains::DELEGATE_TREE, &bytes, &self.signature)
            .map_err(|_| ValidationError::SignatureFailed {
                entity: "delegate tree",
                uuid: self.root,
            })
    }

    /// Persons delegated for `identifier`: every prefix it starts with.
    pub fn delegates_for(&self, identifier: &str) -> BTreeSet<Uuid> {
        self.delegates
            .iter()
            .filter(|(prefix, _)| identifier.starts_with(prefix.as_str()))
            .flat_map(|(_, persons)| persons.iter().copied())
            .collect()
    }
}
