//! # proofnet Core
//!
//! Pure primitives for proofnet: node identities, statements, authorities,
//! proofs, persons, delegate trees and the envelopes the relay carries.
//!
//! This crate contains no I/O, no storage, no networking. The logical term
//! kernel is external: statement terms and proof payloads are opaque bytes,
//! and the only structure this crate knows about is identity (uuids) and
//! dependency edges (logical dependencies and context containment).
//!
//! ## Key Types
//!
//! - [`NodeId`] - 128-bit node identity, the routing key
//! - [`Statement`] - an opaque logical statement with its dependency edges
//! - [`StatementAuthority`] - signatures over a statement
//! - [`Person`] / [`PersonInfo`] - signer identities with monotonic updates
//! - [`DelegateTree`] - signed delegation map of a root context
//! - [`DeferredMessage`] - store-and-forward envelope
//!
//! ## Signing
//!
//! Everything that carries a signature signs deterministic CBOR produced by
//! the [`canonical`] module.

pub mod authority;
pub mod canonical;
pub mod crypto;
pub mod deferred;
pub mod delegate;
pub mod error;
pub mod person;
pub mod proof;
pub mod statement;
pub mod types;
pub mod validation;

pub use authority::{AuthoritySignature, StatementAuthority};
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use deferred::{DeferredMessage, SignatureRequest};
pub use delegate::DelegateTree;
pub use error::{CoreError, ValidationError};
pub use person::{Person, PersonDetails, PersonInfo, PersonInfoVersion};
pub use proof::StatementProof;
pub use statement::{Statement, StatementBuilder, StatementKind};
pub use types::{now_millis, NodeId};
pub use validation::{validate_statement, verify_transfer};

pub use uuid::Uuid;
