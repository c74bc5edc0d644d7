//! Node Registry
//!
//! Single source of truth for the infrastructure under test. One
//! reader/writer lock guards the whole map; it is held only for in-memory
//! map operations, never across a callback, an event send or I/O.
//!
//! Every query returns freshly built copies so callers can never mutate the
//! registry through a returned value.

use super::events::RegistryEvent;
use super::node::{Node, NodeId};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Concurrency-safe catalog of known nodes keyed by registry identity
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_count", &self.len())
            .finish()
    }
}

impl NodeRegistry {
    /// Create a new, empty node registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is fine
        let _ = self.event_sender.send(event);
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add a node, assigning it a fresh identity.
    ///
    /// Fails if the node already carries an identity. Returns a copy of the
    /// stored record.
    pub fn add_node(&self, mut node: Node) -> Result<Node> {
        if let Some(uuid) = node.uuid() {
            return Err(Error::InvalidNode(format!(
                "node {} already has identity {}; identities are assigned by the registry",
                node.name, uuid
            )));
        }

        let uuid = {
            let mut nodes = self.nodes.write();
            let mut uuid = NodeId::generate();
            while nodes.contains_key(&uuid) {
                uuid = NodeId::generate();
            }
            node.set_uuid(uuid.clone());
            nodes.insert(uuid.clone(), node.clone());
            uuid
        };

        self.emit(RegistryEvent::NodeAdded {
            uuid: uuid.to_string(),
            name: node.name.clone(),
        });
        Ok(node)
    }

    /// Replace the stored record with the same identity, wholesale
    pub fn update_node(&self, node: &Node) -> Result<()> {
        let uuid = node
            .uuid()
            .ok_or_else(|| Error::InvalidNode(format!("node {} has no identity", node.name)))?
            .clone();

        {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(&uuid) {
                Some(stored) => *stored = node.clone(),
                None => {
                    return Err(Error::NodeNotFound {
                        node: format!("{} ({})", node.name, uuid),
                    })
                }
            }
        }

        self.emit(RegistryEvent::NodeUpdated {
            uuid: uuid.to_string(),
            name: node.name.clone(),
        });
        Ok(())
    }

    /// Remove a node by identity. Removing an absent identity succeeds.
    pub fn delete_node(&self, node: &Node) -> Result<()> {
        let uuid = node.uuid().ok_or_else(|| {
            Error::InvalidNode(format!(
                "node {} has no identity; only registered nodes can be deleted",
                node.name
            ))
        })?;

        let removed = self.nodes.write().remove(uuid);

        if let Some(removed) = removed {
            self.emit(RegistryEvent::NodeDeleted {
                uuid: uuid.to_string(),
                name: removed.name,
            });
        }
        Ok(())
    }

    /// Remove every node. Callers enumerate first, then clear.
    pub fn clear(&self) {
        let removed = {
            let mut nodes = self.nodes.write();
            let removed = nodes.len();
            nodes.clear();
            removed
        };
        self.emit(RegistryEvent::RegistryCleared { removed });
    }

    /// Atomically replace the whole node set with freshly discovered nodes.
    ///
    /// Every discovered node gets a new identity; none may carry one already.
    pub fn refresh(&self, discovered: Vec<Node>) -> Result<Vec<Node>> {
        if let Some(node) = discovered.iter().find(|n| n.uuid().is_some()) {
            return Err(Error::InvalidNode(format!(
                "discovered node {} already has an identity",
                node.name
            )));
        }

        let added = {
            let mut nodes = self.nodes.write();
            nodes.clear();
            discovered
                .into_iter()
                .map(|mut node| {
                    let mut uuid = NodeId::generate();
                    while nodes.contains_key(&uuid) {
                        uuid = NodeId::generate();
                    }
                    node.set_uuid(uuid.clone());
                    nodes.insert(uuid, node.clone());
                    node
                })
                .collect::<Vec<_>>()
        };

        self.emit(RegistryEvent::RegistryRefreshed {
            node_count: added.len(),
            at: chrono::Utc::now(),
        });
        Ok(sorted(added))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn collect(&self, filter: impl Fn(&Node) -> bool) -> Vec<Node> {
        let nodes: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|n| filter(n))
            .cloned()
            .collect();
        sorted(nodes)
    }

    fn find(&self, filter: impl Fn(&Node) -> bool) -> Option<Node> {
        self.nodes.read().values().find(|n| filter(n)).cloned()
    }

    /// All nodes, ordered by name
    pub fn nodes(&self) -> Vec<Node> {
        self.collect(|_| true)
    }

    pub fn worker_nodes(&self) -> Vec<Node> {
        self.collect(Node::is_worker)
    }

    pub fn master_nodes(&self) -> Vec<Node> {
        self.collect(Node::is_master)
    }

    /// Whether the registered record with this node's identity is a master
    pub fn is_master_node(&self, node: &Node) -> bool {
        node.uuid()
            .and_then(|uuid| self.nodes.read().get(uuid).map(Node::is_master))
            .unwrap_or(false)
    }

    /// Worker nodes with the storage driver installed
    pub fn storage_driver_nodes(&self) -> Vec<Node> {
        self.collect(is_storage_driver_node)
    }

    /// Storage driver nodes with at least one non-empty pool
    pub fn storage_nodes(&self) -> Vec<Node> {
        self.collect(|n| is_storage_driver_node(n) && n.is_storage_node())
    }

    /// Storage driver nodes without any pool
    pub fn storage_less_nodes(&self) -> Vec<Node> {
        self.collect(|n| is_storage_driver_node(n) && !n.is_storage_node())
    }

    pub fn nodes_by_zone(&self, zone: &str) -> Vec<Node> {
        self.collect(|n| n.topology_zone == zone)
    }

    pub fn nodes_by_region(&self, region: &str) -> Vec<Node> {
        self.collect(|n| n.topology_region == region)
    }

    /// Members of the internal metadata / quorum store
    pub fn metadata_nodes(&self) -> Vec<Node> {
        self.collect(|n| n.is_metadata_node)
    }

    /// Nodes keyed by name
    pub fn nodes_by_name(&self) -> HashMap<String, Node> {
        self.nodes
            .read()
            .values()
            .map(|n| (n.name.clone(), n.clone()))
            .collect()
    }

    /// Nodes keyed by storage backend node id
    pub fn nodes_by_vol_driver_node_id(&self) -> HashMap<String, Node> {
        self.nodes
            .read()
            .values()
            .map(|n| (n.vol_driver_node_id.clone(), n.clone()))
            .collect()
    }

    pub fn node_by_name(&self, name: &str) -> Result<Node> {
        self.find(|n| n.name == name).ok_or_else(|| Error::NodeNotFound {
            node: name.to_string(),
        })
    }

    pub fn node_by_address(&self, address: &str) -> Result<Node> {
        self.find(|n| n.has_address(address))
            .ok_or_else(|| Error::NodeNotFound {
                node: format!("address {}", address),
            })
    }

    pub fn node_by_uuid(&self, uuid: &NodeId) -> Result<Node> {
        self.nodes
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound {
                node: uuid.to_string(),
            })
    }

    /// Storage node with the given name
    pub fn storage_node_by_name(&self, name: &str) -> Result<Node> {
        self.find(|n| is_storage_driver_node(n) && n.is_storage_node() && n.name == name)
            .ok_or_else(|| Error::NodeNotFound {
                node: format!("storage node {}", name),
            })
    }

    /// Storage node with the given storage backend node id
    pub fn storage_node_by_vol_driver_id(&self, id: &str) -> Result<Node> {
        self.find(|n| {
            is_storage_driver_node(n) && n.is_storage_node() && n.vol_driver_node_id == id
        })
        .ok_or_else(|| Error::NodeNotFound {
            node: format!("storage node with id {}", id),
        })
    }

    pub fn contains_uuid(&self, uuid: &NodeId) -> bool {
        self.nodes.read().contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            nodes: RwLock::new(HashMap::new()),
            event_sender,
        }
    }
}

fn is_storage_driver_node(node: &Node) -> bool {
    node.is_worker() && node.storage_driver_installed
}

fn sorted(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::node::StoragePool;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn populated() -> Arc<NodeRegistry> {
        let registry = NodeRegistry::new();
        registry
            .add_node(Node::master("master-0").with_addresses(["10.0.0.10"]))
            .unwrap();
        registry
            .add_node(
                Node::worker("worker-0")
                    .with_addresses(["10.0.0.20", "fd00::20"])
                    .with_vol_driver_node_id("px-0")
                    .with_storage(vec![StoragePool::new("pool-a", 100)])
                    .with_topology("zone-a", "region-1")
                    .with_metadata(true),
            )
            .unwrap();
        registry
            .add_node(
                Node::worker("worker-1")
                    .with_addresses(["10.0.0.21"])
                    .with_vol_driver_node_id("px-1")
                    .with_storage(vec![])
                    .with_topology("zone-b", "region-1"),
            )
            .unwrap();
        registry
            .add_node(Node::worker("worker-2").with_topology("zone-b", "region-2"))
            .unwrap();
        registry
    }

    #[test]
    fn test_add_assigns_identity() {
        let registry = NodeRegistry::new();
        let added = registry.add_node(Node::worker("w")).unwrap();

        let uuid = added.uuid().unwrap().clone();
        assert_eq!(registry.node_by_uuid(&uuid).unwrap().name, "w");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_rejects_preassigned_identity() {
        let registry = NodeRegistry::new();
        let added = registry.add_node(Node::worker("w")).unwrap();

        let result = registry.add_node(added);
        assert_matches!(result, Err(Error::InvalidNode(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_unknown_identity_leaves_registry_untouched() {
        let registry = populated();
        let before = registry.nodes();

        let other = NodeRegistry::new();
        let foreign = other.add_node(Node::worker("ghost")).unwrap();

        assert_matches!(registry.update_node(&foreign), Err(Error::NodeNotFound { .. }));
        assert_eq!(registry.nodes(), before);

        let unregistered = Node::worker("ghost");
        assert_matches!(registry.update_node(&unregistered), Err(Error::InvalidNode(_)));
    }

    #[test]
    fn test_update_replaces_record_wholesale() {
        let registry = populated();
        let original = registry.node_by_name("worker-0").unwrap();

        let mut replacement = original.clone();
        replacement.pools.clear();
        replacement.labels.clear();
        replacement.is_metadata_node = false;
        replacement.addresses = vec!["10.9.9.9".to_string()];
        registry.update_node(&replacement).unwrap();

        let stored = registry.node_by_uuid(original.uuid().unwrap()).unwrap();
        assert_eq!(stored, replacement);
        assert!(stored.pools.is_empty());
        assert!(!stored.has_address("10.0.0.20"));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let registry = populated();
        let node = registry.node_by_name("worker-2").unwrap();

        registry.delete_node(&node).unwrap();
        let after_first = registry.nodes();

        registry.delete_node(&node).unwrap();
        assert_eq!(registry.nodes(), after_first);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_delete_requires_identity() {
        let registry = populated();
        let result = registry.delete_node(&Node::worker("worker-2"));
        assert_matches!(result, Err(Error::InvalidNode(_)));
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_role_and_storage_queries() {
        let registry = populated();

        let names = |nodes: Vec<Node>| nodes.into_iter().map(|n| n.name).collect::<Vec<_>>();

        assert_eq!(names(registry.master_nodes()), vec!["master-0"]);
        assert_eq!(
            names(registry.worker_nodes()),
            vec!["worker-0", "worker-1", "worker-2"]
        );
        assert_eq!(
            names(registry.storage_driver_nodes()),
            vec!["worker-0", "worker-1"]
        );
        assert_eq!(names(registry.storage_nodes()), vec!["worker-0"]);
        assert_eq!(names(registry.storage_less_nodes()), vec!["worker-1"]);
        assert_eq!(names(registry.metadata_nodes()), vec!["worker-0"]);

        let master = registry.node_by_name("master-0").unwrap();
        assert!(registry.is_master_node(&master));
        assert!(!registry.is_master_node(&registry.node_by_name("worker-0").unwrap()));
    }

    #[test]
    fn test_topology_queries() {
        let registry = populated();
        assert_eq!(registry.nodes_by_zone("zone-b").len(), 2);
        assert_eq!(registry.nodes_by_region("region-1").len(), 2);
        assert!(registry.nodes_by_zone("zone-z").is_empty());
    }

    #[test]
    fn test_lookups() {
        let registry = populated();

        assert_eq!(registry.node_by_address("fd00::20").unwrap().name, "worker-0");
        assert_matches!(
            registry.node_by_address("192.168.1.1"),
            Err(Error::NodeNotFound { .. })
        );
        assert_matches!(registry.node_by_name("nope"), Err(Error::NodeNotFound { .. }));

        assert_eq!(
            registry.storage_node_by_vol_driver_id("px-0").unwrap().name,
            "worker-0"
        );
        // worker-1 has the driver but no pool
        assert!(registry.storage_node_by_name("worker-1").is_err());

        let by_name = registry.nodes_by_name();
        assert_eq!(by_name.len(), 4);
        assert_eq!(by_name["worker-1"].vol_driver_node_id, "px-1");
        assert!(registry.nodes_by_vol_driver_node_id().contains_key("px-0"));
    }

    #[test]
    fn test_queries_return_copies() {
        let registry = populated();

        let mut nodes = registry.nodes();
        for node in nodes.iter_mut() {
            node.name = "mutated".to_string();
            node.pools.clear();
        }

        assert!(registry.node_by_name("worker-0").unwrap().is_storage_node());
        assert!(registry.nodes().iter().all(|n| n.name != "mutated"));
    }

    #[test]
    fn test_clear_and_refresh() {
        let registry = populated();
        let old_ids: HashSet<_> = registry
            .nodes()
            .iter()
            .map(|n| n.uuid().unwrap().clone())
            .collect();

        let rediscovered: Vec<Node> = registry.nodes().iter().map(Node::without_identity).collect();
        let refreshed = registry.refresh(rediscovered).unwrap();

        assert_eq!(refreshed.len(), 4);
        assert!(refreshed.iter().all(|n| !old_ids.contains(n.uuid().unwrap())));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_refresh_rejects_identified_nodes() {
        let registry = populated();
        let nodes = registry.nodes();

        assert_matches!(registry.refresh(nodes), Err(Error::InvalidNode(_)));
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_events_are_broadcast() {
        let registry = NodeRegistry::new();
        let mut events = registry.subscribe();

        let node = registry.add_node(Node::worker("w")).unwrap();
        registry.update_node(&node).unwrap();
        registry.delete_node(&node).unwrap();
        registry.clear();

        assert_matches!(events.try_recv().unwrap(), RegistryEvent::NodeAdded { ref name, .. } if name == "w");
        assert_matches!(events.try_recv().unwrap(), RegistryEvent::NodeUpdated { .. });
        assert_matches!(events.try_recv().unwrap(), RegistryEvent::NodeDeleted { .. });
        assert_matches!(events.try_recv().unwrap(), RegistryEvent::RegistryCleared { removed: 0 });
    }

    #[test]
    fn test_concurrent_adds_produce_distinct_identities() {
        let registry = NodeRegistry::new();

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .add_node(Node::worker(format!("node-{:03}", i)))
                        .unwrap()
                })
            })
            .collect();

        let added: Vec<Node> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ids: HashSet<_> = added.iter().map(|n| n.uuid().unwrap().clone()).collect();

        assert_eq!(registry.len(), 100);
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn test_concurrent_adds_and_deletes_across_tasks() {
        let registry = NodeRegistry::new();

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let node = registry.add_node(Node::worker(format!("n-{}", i))).unwrap();
                    if i % 2 == 0 {
                        registry.delete_node(&node).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 25);
    }

    proptest! {
        #[test]
        fn prop_update_replaces_fields(zone in "[a-z]{1,8}", addr in "10\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}") {
            let registry = NodeRegistry::new();
            let node = registry
                .add_node(Node::worker("w").with_addresses(["192.168.0.1"]).with_label("k", "v"))
                .unwrap();

            let mut replacement = node.without_identity();
            replacement.labels.clear();
            replacement.topology_zone = zone.clone();
            replacement.addresses = vec![addr.clone()];
            replacement.set_uuid(node.uuid().unwrap().clone());
            registry.update_node(&replacement).unwrap();

            let stored = registry.node_by_name("w").unwrap();
            prop_assert!(stored.labels.is_empty());
            prop_assert_eq!(stored.topology_zone, zone);
            prop_assert_eq!(stored.addresses, vec![addr]);
        }
    }
}
