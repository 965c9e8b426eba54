//! # Proofnet Sync
//!
//! Peer-to-peer synchronization of a proofnet knowledge base.
//!
//! ## Overview
//!
//! Two nodes connect, salute each other and pick one of three activities
//! (sub-roots) for the connection:
//!
//! - **Statement**: a long-lived session. After an initial pass that
//!   exchanges persons, subscriptions, the statements they cover and
//!   deferred-message custody, the two peers loop: they agree on a dialog
//!   type with symmetric selection, run it, and repeat until both agree on
//!   valediction.
//! - **DeferredMessage**: hand one message towards its recipient. The
//!   responder keeps it or redirects the sender to a closer node.
//! - **SignatureRequest**: deliver one request for signatures.
//!
//! Every dialog that writes to the store runs under a distributed lock:
//! the node-wide local lock on both ends, acquired through a handshake that
//! backs off with random jitter so that two nodes never hold one lock each
//! and wait for the other.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use proofnet_core::NodeId;
//! use proofnet_store::MemoryStore;
//! use proofnet_sync::{run_session, ConnectionState, Endpoint, SessionIntent, SyncConfig, SyncContext};
//! use proofnet_sync::transport::{TcpTransport, Transport};
//!
//! async fn example() -> proofnet_sync::Result<()> {
//!     let ctx = SyncContext::new(NodeId::random(), Arc::new(MemoryStore::new()), SyncConfig::default());
//!     let addr = "127.0.0.1:7400".parse().unwrap();
//!     let stream = TcpTransport.connect(addr).await?;
//!     let conn = ctx.connection(stream, Some(addr));
//!     let state = Arc::new(ConnectionState::new(conn.id()));
//!     let endpoint = Endpoint::Dialer { expected: None, intent: SessionIntent::Statement };
//!     let outcome = run_session(&ctx, conn, endpoint, state).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Dialer (male)                       Acceptor (female)
//!   |-------- Salutation ------------->|
//!   |<------- Salutation --------------|
//!   |-------- SubRootRequest --------->|
//!   |<------- SubRootResponse ---------|
//!   |                                  |
//!   |  persistent dialog:              |
//!   |<------- LockInit ----------------|
//!   |-------- LockRequest ------------>|
//!   |<------- LockResponse ------------|
//!   |<======= body (both ways) =======>|
//! ```

pub mod connection;
pub mod context;
pub mod deferred;
pub mod dialog;
pub mod error;
pub mod lock;
pub mod persistent;
pub mod phase;
pub mod replication;
pub mod resource;
pub mod salutation;
pub mod selection;
pub mod subscription;
pub mod transport;
pub mod wire;

pub use connection::{Connection, ConnectionId};
pub use context::{LockConfig, SyncConfig, SyncContext};
pub use deferred::{ClosestNode, DeferredOutcome, LocalCustody, NodeAddress, RoutingTable};
pub use error::{ErrorClass, Result, SyncError};
pub use phase::{
    deliver_deferred, run_session, ConnectionReport, Endpoint, LoopDialogType, SessionIntent,
    SessionOutcome, SubRootType,
};
pub use salutation::{Gender, PeerInfo};
pub use subscription::{ConnectionState, SessionStage};
pub use transport::memory::{MemoryListener, MemoryNetwork, MemoryTransport};
pub use transport::{RouteSplicer, TcpTransport, Transport};
pub use wire::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
