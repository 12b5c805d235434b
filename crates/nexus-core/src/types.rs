//! Core type definitions for Nexus

use crate::session::ModelSession;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the cluster.
///
/// Node ids are chosen by the nodes themselves at registration time; the
/// scheduler rejects duplicates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Get the raw wire representation
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Roles that a node can fulfill in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Backend nodes host GPUs and execute model instances
    Backend,
    /// Frontend nodes accept application queries and route them to backends
    Frontend,
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backend" => Ok(NodeType::Backend),
            "frontend" => Ok(NodeType::Frontend),
            _ => Err(format!("Unknown node type: {}", s)),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Backend => write!(f, "backend"),
            NodeType::Frontend => write!(f, "frontend"),
        }
    }
}

/// Network identity of a backend, as distributed in routing tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BackendInfo {
    /// Node identifier
    pub node_id: NodeId,

    /// IP address observed at registration
    pub ip: String,

    /// Port serving inference queries
    pub server_port: String,

    /// Port serving control RPCs
    pub rpc_port: String,
}

impl BackendInfo {
    /// Address of the control endpoint
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }
}

/// One backend's share of a model route, with its sustained throughput
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRate {
    /// Backend identity
    pub info: BackendInfo,

    /// Throughput in requests per second this backend sustains for the model
    pub throughput: f64,
}

/// Routing entry for one model session, pushed to subscribed frontends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRoute {
    /// Stringified model session id (the routing key)
    pub model_session_id: String,

    /// Serving backends with their throughput weights
    pub backend_rate: Vec<BackendRate>,
}

/// Plan for one model instance, as pushed to a backend in a table update.
///
/// `model_sessions` lists the whole prefix-sharing group, head first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstanceConfig {
    /// Sessions served by this instance (head plus prefix-shared siblings)
    pub model_sessions: Vec<ModelSession>,

    /// Target batch size
    pub batch: u32,

    /// Largest batch the instance may ever execute
    pub max_batch: u32,

    /// Batch accumulation window in microseconds
    pub duty_cycle_us: f64,

    /// GPU memory reserved for this instance in bytes
    pub memory_usage: u64,

    /// Backup backends prepared for failover
    pub backup_backends: Vec<BackendInfo>,
}

/// Full model-table update pushed to one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelTableUpdate {
    /// Every instance the backend should be serving after this update
    pub model_instances: Vec<ModelInstanceConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId(7);
        assert_eq!(id.to_string(), "7");
        assert_eq!(id.as_u32(), 7);
        assert_eq!(NodeId::from(7u32), id);
    }

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("backend".parse::<NodeType>().unwrap(), NodeType::Backend);
        assert_eq!("FRONTEND".parse::<NodeType>().unwrap(), NodeType::Frontend);
        assert!("router".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_backend_info_rpc_addr() {
        let info = BackendInfo {
            node_id: NodeId(1),
            ip: "10.0.0.5".to_string(),
            server_port: "9001".to_string(),
            rpc_port: "9002".to_string(),
        };
        assert_eq!(info.rpc_addr(), "10.0.0.5:9002");
    }
}
