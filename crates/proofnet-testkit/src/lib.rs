//! # Proofnet Testkit
//!
//! Testing utilities for proofnet.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Generators**: Proptest strategies for statement DAGs and persons
//! - **Fixtures**: Signing identities and a two-node harness over an
//!   in-memory network
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use proofnet_testkit::generators::statement_dag;
//!
//! proptest! {
//!     #[test]
//!     fn dependencies_come_first(statements in statement_dag(30)) {
//!         // every reference points at an earlier statement
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use proofnet_testkit::fixtures::NodePair;
//!
//! async fn example() {
//!     let mut pair = NodePair::new().await;
//!     let (dialer, acceptor) = pair.connect().await.unwrap();
//!     dialer.request_valediction();
//!     dialer.join().await.unwrap();
//!     acceptor.join().await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{fast_config, Author, NodePair};
pub use generators::{person_history, statement_dag};
