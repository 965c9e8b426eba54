//! Statement authorities: who authored a statement and who signed it.
//!
//! A signature with `signed_proof` set additionally attests that the signer
//! checked the statement's proof.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::{authority_signing_bytes, domains};
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::ValidationError;

/// One authorizer's signature over a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritySignature {
    /// Person who signed.
    pub authorizer: Uuid,
    /// When the signature was made (Unix ms).
    pub signed_at: i64,
    /// Whether the signature also covers the statement's proof.
    pub signed_proof: bool,
    pub signature: Ed25519Signature,
}

/// Authorship and signatures of a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementAuthority {
    pub statement: Uuid,
    /// Context of the statement, copied so change listeners can route
    /// authority updates without a store lookup.
    pub context: Option<Uuid>,
    /// Person who authored the statement.
    pub author: Uuid,
    pub created_at: i64,
    pub signatures: Vec<AuthoritySignature>,
}

impl StatementAuthority {
    /// Create an unsigned authority.
    pub fn new(statement: Uuid, context: Option<Uuid>, author: Uuid, created_at: i64) -> Self {
        Self {
            statement,
            context,
            author,
            created_at,
            signatures: Vec::new(),
        }
    }

    /// Sign as `authorizer`, replacing any previous signature by that person.
    pub fn sign(&mut self, authorizer: Uuid, keypair: &Keypair, signed_at: i64, signed_proof: bool) {
        let bytes = authority_signing_bytes(&self.statement, &authorizer, signed_at, signed_proof);
        let signature = keypair.sign_domain(domains::AUTHORITY, &bytes);
        self.signatures.retain(|s| s.authorizer != authorizer);
        self.signatures.push(AuthoritySignature {
            authorizer,
            signed_at,
            signed_proof,
            signature,
        });
    }

    /// Whether any authorizer signed the proof.
    pub fn signed_proof(&self) -> bool {
        self.signatures.iter().any(|s| s.signed_proof)
    }

    /// Signature of one authorizer.
    pub fn signature_of(&self, authorizer: &Uuid) -> Option<&AuthoritySignature> {
        self.signatures.iter().find(|s| &s.authorizer == authorizer)
    }

    /// Whether `other` carries a signature this authority lacks or holds
    /// in an older version.
    pub fn is_superseded_by(&self, other: &StatementAuthority) -> bool {
        other.signatures.iter().any(|theirs| match self.signature_of(&theirs.authorizer) {
            Some(ours) => theirs.signed_at > ours.signed_at,
            None => true,
        })
    }

    /// Merge newer signatures from `other`. Returns true if anything changed.
    ///
    /// Callers verify `other` first.
    pub fn merge(&mut self, other: &StatementAuthority) -> bool {
        let mut changed = false;
        for theirs in &other.signatures {
            match self.signatures.iter_mut().find(|s| s.authorizer == theirs.authorizer) {
                Some(ours) if theirs.signed_at > ours.signed_at => {
                    *ours = theirs.clone();
                    changed = true;
                }
                Some(_) => {}
                None => {
                    self.signatures.push(theirs.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Verify every signature, resolving signer keys through `key_of`.
    pub fn verify<F>(&self, key_of: F) -> Result<(), ValidationError>
    where
        F: Fn(&Uuid) -> Option<Ed25519PublicKey>,
    {
        for sig in &self.signatures {
            let key = key_of(&sig.authorizer).ok_or(ValidationError::UnknownSigner(sig.authorizer))?;
            let bytes =
                authority_signing_bytes(&self.statement, &sig.authorizer, sig.signed_at, sig.signed_proof);
            key.verify_domain(domains::AUTHORITY, &bytes, &sig.signature)
                .map_err(|_| ValidationError::SignatureFailed {
                    entity: "authority",
                    uuid: self.statement,
                })?;
        }
        Ok(())
    }
}
