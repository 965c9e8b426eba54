//! Structural checks and signature verification for entities received from a
//! peer.

use std::collections::HashMap;

use uuid::Uuid;

use crate::authority::StatementAuthority;
use crate::crypto::Ed25519PublicKey;
use crate::error::ValidationError;
use crate::person::Person;
use crate::statement::Statement;

/// Validate a statement's own structure.
///
/// - A root context lives in no context.
/// - Every other statement lives in exactly one context.
/// - A statement never depends on itself or contains itself.
pub fn validate_statement(statement: &Statement) -> Result<(), ValidationError> {
    match (statement.is_root_context(), statement.context) {
        (true, Some(_)) => return Err(ValidationError::NestedRootContext(statement.uuid)),
        (false, None) => return Err(ValidationError::MissingContext(statement.uuid)),
        _ => {}
    }

    if statement.references().any(|r| r == statement.uuid) {
        return Err(ValidationError::SelfDependency(statement.uuid));
    }

    Ok(())
}

/// Verify a replication response as a whole.
///
/// Persons in the transfer are checked first: their self-signatures must
/// verify and their keys must match any key already known locally through
/// `known_key`. Authorities are then verified against the transferred
/// persons, falling back to `known_key`. An authority whose statement is in
/// the transfer must agree with it on context.
///
/// Any failure rejects the whole transfer.
pub fn verify_transfer<F>(
    statements: &[Statement],
    authorities: &[StatementAuthority],
    persons: &[Person],
    known_key: F,
) -> Result<(), ValidationError>
where
    F: Fn(&Uuid) -> Option<Ed25519PublicKey>,
{
    for statement in statements {
        validate_statement(statement)?;
    }

    let mut keys: HashMap<Uuid, Ed25519PublicKey> = HashMap::with_capacity(persons.len());
    for person in persons {
        if let Some(known) = known_key(&person.uuid) {
            if known != person.public_key {
                return Err(ValidationError::PublicKeyMismatch(person.uuid));
            }
        }
        person.verify()?;
        keys.insert(person.uuid, person.public_key);
    }

    let contexts: HashMap<Uuid, Option<Uuid>> =
        statements.iter().map(|s| (s.uuid, s.context)).collect();

    for authority in authorities {
        if let Some(context) = contexts.get(&authority.statement) {
            if *context != authority.context {
                return Err(ValidationError::AuthorityMismatch(authority.statement));
            }
        }
        authority.verify(|uuid| keys.get(uuid).copied().or_else(|| known_key(uuid)))?;
    }

    Ok(())
}
