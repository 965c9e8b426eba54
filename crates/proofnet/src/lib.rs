//! # Proofnet
//!
//! A node of the proofnet network: a local knowledge base of signed
//! statements, kept in sync with peers.
//!
//! ## Overview
//!
//! - **Statements** live in contexts, which nest under root contexts. A
//!   node subscribes to contexts and receives every statement in them,
//!   always after the statements they depend on.
//! - **Authorities, proofs, persons and delegate trees** travel as
//!   resources: advertised with version metadata, requested only when
//!   newer.
//! - **Deferred messages** are relayed store-and-forward towards their
//!   recipient and handed over when it connects.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use proofnet::{Node, NodeConfig};
//! use proofnet::core::{NodeId, StatementBuilder};
//! use proofnet::store::MemoryStore;
//! use proofnet::sync::TcpTransport;
//!
//! async fn example() -> proofnet::Result<()> {
//!     proofnet::logging::init();
//!     let node = Node::new(
//!         NodeConfig::new(NodeId::random()),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(TcpTransport),
//!     );
//!
//!     let root = StatementBuilder::root_context().build();
//!     node.put_statements(vec![root.clone()]).await?;
//!     node.subscribe(root.uuid, true).await?;
//!
//!     let peer = node.connect("10.0.0.2:7400".parse().unwrap(), None).await?;
//!     // ... later
//!     peer.request_valediction();
//!     let outcome = peer.join().await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `proofnet::core` - statements, persons, signatures
//! - `proofnet::store` - the store interface and the in-memory store
//! - `proofnet::sync` - the protocol engine

pub mod config;
pub mod error;
pub mod logging;
pub mod node;

pub use proofnet_core as core;
pub use proofnet_store as store;
pub use proofnet_sync as sync;

pub use config::{NodeConfig, Route};
pub use error::{NodeError, Result};
pub use node::{ConnectionHandle, Node, Server};

pub use proofnet_core::{
    DeferredMessage, Keypair, NodeId, Person, PersonDetails, SignatureRequest, Statement,
    StatementAuthority, StatementBuilder, StatementKind, Uuid,
};
pub use proofnet_sync::{SessionOutcome, SessionStage, SubRootType, SyncConfig};
