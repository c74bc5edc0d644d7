//! Node Record
//!
//! The node shape exchanged between the node registry and every driver.
//! Drivers translate their native topology into this record when they
//! report discovered infrastructure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bytes per GiB
pub const GIB: u64 = 1 << 30;

// =============================================================================
// Node ID
// =============================================================================

/// Registry-assigned identity of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh, globally unique identity
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Node Type
// =============================================================================

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Control plane node
    Master,
    /// Worker / agent node
    #[default]
    Worker,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Master => write!(f, "master"),
            NodeType::Worker => write!(f, "worker"),
        }
    }
}

// =============================================================================
// Storage Pools
// =============================================================================

/// How a pool should grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeType {
    /// Let the storage backend decide
    Auto,
    /// Add a new drive to the pool
    AddDisk,
    /// Grow the existing drives
    ResizeDisk,
}

/// Status of the last operation run against a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolOperationStatus {
    Pending,
    InProgress,
    Successful,
    Failed,
}

impl std::fmt::Display for PoolOperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolOperationStatus::Pending => write!(f, "pending"),
            PoolOperationStatus::InProgress => write!(f, "in-progress"),
            PoolOperationStatus::Successful => write!(f, "successful"),
            PoolOperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Last operation reported by the storage backend for a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOperation {
    pub status: PoolOperationStatus,
    /// Human readable progress message
    #[serde(default)]
    pub message: String,
}

/// A storage pool hosted on a node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoragePool {
    /// Pool UUID as reported by the storage backend
    pub uuid: String,
    /// Pool index on its node
    #[serde(default)]
    pub id: u32,
    /// Total pool size in bytes
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub last_operation: Option<PoolOperation>,
}

impl StoragePool {
    pub fn new(uuid: impl Into<String>, total_size_gib: u64) -> Self {
        Self {
            uuid: uuid.into(),
            total_size_bytes: total_size_gib * GIB,
            ..Default::default()
        }
    }

    /// Total size in whole GiB
    pub fn total_size_gib(&self) -> u64 {
        self.total_size_bytes / GIB
    }
}

// =============================================================================
// Node
// =============================================================================

/// One machine in the infrastructure under test
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    /// Assigned by the node registry, never by callers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uuid: Option<NodeId>,
    /// Identity of this node inside the storage backend
    #[serde(default)]
    pub vol_driver_node_id: String,
    pub name: String,
    /// Stable hostname, survives decommission and rejoin
    #[serde(default)]
    pub hostname: String,
    /// Network addresses, most preferred first
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub storage_driver_installed: bool,
    #[serde(default)]
    pub pools: Vec<StoragePool>,
    #[serde(default)]
    pub topology_zone: String,
    #[serde(default)]
    pub topology_region: String,
    /// Member of the internal metadata / quorum store
    #[serde(default)]
    pub is_metadata_node: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        let name = name.into();
        Self {
            hostname: name.clone(),
            name,
            node_type,
            ..Default::default()
        }
    }

    pub fn worker(name: impl Into<String>) -> Self {
        Self::new(name, NodeType::Worker)
    }

    pub fn master(name: impl Into<String>) -> Self {
        Self::new(name, NodeType::Master)
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_vol_driver_node_id(mut self, id: impl Into<String>) -> Self {
        self.vol_driver_node_id = id.into();
        self
    }

    /// Mark the storage driver as installed and attach pools
    pub fn with_storage(mut self, pools: Vec<StoragePool>) -> Self {
        self.storage_driver_installed = true;
        self.pools = pools;
        self
    }

    pub fn with_topology(mut self, zone: impl Into<String>, region: impl Into<String>) -> Self {
        self.topology_zone = zone.into();
        self.topology_region = region.into();
        self
    }

    pub fn with_metadata(mut self, is_metadata_node: bool) -> Self {
        self.is_metadata_node = is_metadata_node;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Registry identity, `None` until the node has been added
    pub fn uuid(&self) -> Option<&NodeId> {
        self.uuid.as_ref()
    }

    pub(crate) fn set_uuid(&mut self, uuid: NodeId) {
        self.uuid = Some(uuid);
    }

    /// Copy of this record with the registry identity stripped
    pub fn without_identity(&self) -> Node {
        Node {
            uuid: None,
            ..self.clone()
        }
    }

    /// A node is a storage node iff it has at least one non-empty pool
    pub fn is_storage_node(&self) -> bool {
        self.pools.iter().any(|p| !p.uuid.is_empty())
    }

    pub fn is_master(&self) -> bool {
        self.node_type == NodeType::Master
    }

    pub fn is_worker(&self) -> bool {
        self.node_type == NodeType::Worker
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a == address)
    }

    /// Resource label used in convergence errors
    pub fn resource(&self) -> String {
        format!("node/{}", self.name)
    }
}

/// Whether `nodes` contains a node with the same name as `node`
pub fn contains(nodes: &[Node], node: &Node) -> bool {
    nodes.iter().any(|n| n.name == node.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_node_requires_non_empty_pool() {
        let bare = Node::worker("w1").with_storage(vec![]);
        assert!(!bare.is_storage_node());

        let empty_pool = Node::worker("w2").with_storage(vec![StoragePool::default()]);
        assert!(!empty_pool.is_storage_node());

        let storage = Node::worker("w3").with_storage(vec![StoragePool::new("pool-0", 100)]);
        assert!(storage.is_storage_node());
    }

    #[test]
    fn test_pool_size_in_gib() {
        let pool = StoragePool::new("p", 200);
        assert_eq!(pool.total_size_bytes, 200 * GIB);
        assert_eq!(pool.total_size_gib(), 200);
    }

    #[test]
    fn test_without_identity() {
        let mut node = Node::master("m1");
        node.set_uuid(NodeId::generate());
        assert!(node.uuid().is_some());

        let copy = node.without_identity();
        assert!(copy.uuid().is_none());
        assert_eq!(copy.name, "m1");
    }

    #[test]
    fn test_contains_matches_by_name() {
        let nodes = vec![Node::worker("a"), Node::worker("b")];
        assert!(contains(&nodes, &Node::master("a")));
        assert!(!contains(&nodes, &Node::worker("c")));
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::worker("w1")
            .with_addresses(["10.0.0.1"])
            .with_topology("zone-a", "region-1");
        let json = serde_json::to_value(&node).unwrap();
        assert!(json.get("uuid").is_none());
        assert_eq!(json["node_type"], "worker");
        assert_eq!(json["topology_zone"], "zone-a");
    }
}
