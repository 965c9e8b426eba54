//! Node configuration.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use proofnet_core::NodeId;
use proofnet_sync::SyncConfig;

use crate::error::{NodeError, Result};

/// A directly reachable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub node: NodeId,
    pub address: SocketAddr,
}

/// Configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity presented during salutation.
    pub node: NodeId,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Initial routing table for deferred messages and splicing.
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl NodeConfig {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            sync: SyncConfig::default(),
            routes: Vec::new(),
        }
    }

    /// Parse a JSON document. Omitted sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| NodeError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proofnet_sync::SubRootType;

    #[test]
    fn test_minimal_config() {
        let config =
            NodeConfig::from_json_str(r#"{"node": "6f1c2a34-0000-4000-8000-000000000001"}"#).unwrap();
        assert_eq!(config.sync, SyncConfig::default());
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "node": "6f1c2a34-0000-4000-8000-000000000001",
            "sync": {
                "idle_timeout_ms": 1000,
                "sub_roots": ["Statement"],
                "lock": {"base_timeout_ms": 100}
            },
            "routes": [
                {"node": "6f1c2a34-0000-4000-8000-000000000002", "address": "10.0.0.2:7400"}
            ]
        }"#;
        let config = NodeConfig::from_json_str(json).unwrap();
        assert_eq!(config.sync.idle_timeout_ms, 1000);
        assert_eq!(config.sync.lock.base_timeout_ms, 100);
        assert_eq!(config.sync.lock.jitter_ms, 250);
        assert!(!config.sync.accepts(SubRootType::DeferredMessage));
        assert_eq!(config.routes[0].address, "10.0.0.2:7400".parse().unwrap());
    }

    #[test]
    fn test_missing_node_rejected() {
        assert!(matches!(
            NodeConfig::from_json_str(r#"{"routes": []}"#),
            Err(NodeError::Config(_))
        ));
    }
}
