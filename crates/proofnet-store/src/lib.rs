//! # proofnet Store
//!
//! The transactional store interface consumed by the sync engine, with an
//! in-memory implementation.
//!
//! ## Key Types
//!
//! - [`Store`] - async trait: begin/commit/abort, reads, listeners
//! - [`Transaction`] - staged [`Change`]s plus the originating connection
//! - [`StoreListener`] - commit hook receiving a [`CommitEvent`]
//! - [`MemoryStore`] - in-memory implementation
//!
//! ## Design Notes
//!
//! - **Read your writes**: reads through a transaction see its staged changes.
//! - **Atomic commit**: a commit that fails validation applies nothing.
//! - **Listeners after commit**: listeners run once the new state is visible,
//!   never while a transaction is half-applied.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use traits::{Change, CommitEvent, ListenerId, Store, StoreListener, Transaction};
