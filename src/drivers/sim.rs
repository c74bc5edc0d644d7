//! Simulated Drivers
//!
//! In-memory implementations of every capability port backed by one shared
//! [`SimCluster`]. Observations are scripted: each read pops the next
//! scripted value and the last one sticks, so a test can describe exactly
//! what a backend reports on every poll.

use crate::domain::ports::{
    BackupDriver, BackupInfo, BackupRequest, BackupStatus, ConnectionOptions, DriverVersion,
    InitOptions, MetadataMember, NodeDriver, NodeStatus, SchedulerDriver, UpgradeStatus,
    VolumeDriver,
};
use crate::error::{Error, Result};
use crate::nodes::{Node, PoolOperation, PoolOperationStatus, ResizeType, StoragePool, GIB};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Name the simulated drivers register under
pub const SIM_DRIVER_NAME: &str = "sim";

/// Version reported before any upgrade
pub const SIM_BASE_VERSION: &str = "3.1.0";

// =============================================================================
// Scripts
// =============================================================================

/// Sequence of observations; the final one repeats forever
#[derive(Debug, Clone)]
struct Script<T: Clone>(VecDeque<T>);

impl<T: Clone> Script<T> {
    fn new(values: impl IntoIterator<Item = T>) -> Self {
        Self(values.into_iter().collect())
    }

    fn next(&mut self) -> Option<T> {
        if self.0.len() > 1 {
            self.0.pop_front()
        } else {
            self.0.front().cloned()
        }
    }
}

/// What a pool reports on one read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolObservation {
    pub status: PoolOperationStatus,
    pub message: String,
    pub size_gib: u64,
}

impl PoolObservation {
    pub fn new(status: PoolOperationStatus, message: impl Into<String>, size_gib: u64) -> Self {
        Self {
            status,
            message: message.into(),
            size_gib,
        }
    }
}

/// A pending rejoin: the node reappears after `remaining` listings
#[derive(Debug, Clone)]
struct PendingRejoin {
    remaining: Option<u32>,
    node: Node,
}

// =============================================================================
// Cluster State
// =============================================================================

#[derive(Debug, Default)]
struct ClusterState {
    /// Authoritative node listing, in discovery order
    nodes: Vec<Node>,
    pools: HashMap<String, StoragePool>,
    pool_scripts: HashMap<String, Script<PoolObservation>>,
    node_status: HashMap<String, Script<NodeStatus>>,
    driver_up: HashMap<String, Script<bool>>,
    members: Option<Script<Vec<MetadataMember>>>,
    versions: HashMap<String, Script<DriverVersion>>,
    backups: HashMap<String, (BackupRequest, Script<BackupInfo>)>,
    pending_rejoins: HashMap<String, PendingRejoin>,
    /// Hostnames whose rejoin never completes
    held_rejoins: HashSet<String>,
    rejoin_delay: u32,
    init_options: Vec<InitOptions>,
    commands: Vec<(String, String)>,
    pool_reads: HashMap<String, usize>,
    listings: usize,
    /// Remaining injected failures per backend read operation
    read_faults: HashMap<String, u32>,
}

impl ClusterState {
    fn take_fault(&mut self, operation: &str) -> Result<()> {
        match self.read_faults.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::BackendOperationFailed {
                    backend: SIM_DRIVER_NAME.to_string(),
                    operation: operation.to_string(),
                    reason: "connection reset".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Shared in-memory cluster behind the simulated drivers
#[derive(Debug)]
pub struct SimCluster {
    state: RwLock<ClusterState>,
}

impl SimCluster {
    /// Create a cluster with the given authoritative node listing
    pub fn new(nodes: Vec<Node>) -> Arc<Self> {
        let pools = nodes
            .iter()
            .flat_map(|n| n.pools.iter().cloned())
            .filter(|p| !p.uuid.is_empty())
            .map(|p| (p.uuid.clone(), p))
            .collect();

        Arc::new(Self {
            state: RwLock::new(ClusterState {
                nodes: nodes.into_iter().map(|n| n.without_identity()).collect(),
                pools,
                rejoin_delay: 1,
                ..Default::default()
            }),
        })
    }

    /// One master and `workers` storage workers spread over three zones.
    /// The first three workers are metadata members; every worker has one
    /// 100 GiB pool.
    pub fn with_topology(workers: usize) -> Arc<Self> {
        let mut nodes = vec![Node::master("master-0").with_addresses(["10.0.0.10"])];
        for i in 0..workers {
            nodes.push(
                Node::worker(format!("worker-{}", i))
                    .with_addresses([format!("10.0.1.{}", 10 + i)])
                    .with_vol_driver_node_id(format!("sim-node-{}", i))
                    .with_storage(vec![StoragePool::new(format!("pool-{}", i), 100)])
                    .with_topology(format!("zone-{}", i % 3), "region-1")
                    .with_metadata(i < 3),
            );
        }
        Self::new(nodes)
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    pub async fn script_pool(&self, pool_uuid: &str, observations: Vec<PoolObservation>) {
        self.state
            .write()
            .await
            .pool_scripts
            .insert(pool_uuid.to_string(), Script::new(observations));
    }

    pub async fn script_node_status(&self, node_name: &str, statuses: Vec<NodeStatus>) {
        self.state
            .write()
            .await
            .node_status
            .insert(node_name.to_string(), Script::new(statuses));
    }

    pub async fn script_driver_up(&self, node_name: &str, states: Vec<bool>) {
        self.state
            .write()
            .await
            .driver_up
            .insert(node_name.to_string(), Script::new(states));
    }

    pub async fn script_members(&self, observations: Vec<Vec<MetadataMember>>) {
        self.state.write().await.members = Some(Script::new(observations));
    }

    pub async fn script_versions(&self, node_name: &str, versions: Vec<DriverVersion>) {
        self.state
            .write()
            .await
            .versions
            .insert(node_name.to_string(), Script::new(versions));
    }

    /// Script the statuses a backup reports once created
    pub async fn script_backup(&self, request: BackupRequest, statuses: Vec<(BackupStatus, &str)>) {
        let now = chrono::Utc::now();
        let infos = statuses.into_iter().map(|(status, reason)| BackupInfo {
            name: request.name.clone(),
            status,
            reason: reason.to_string(),
            created_at: now,
        });
        let script = Script::new(infos);
        self.state
            .write()
            .await
            .backups
            .insert(request.name.clone(), (request, script));
    }

    /// A rejoining node with this hostname never shows up again
    pub async fn hold_rejoin(&self, hostname: &str) {
        self.state
            .write()
            .await
            .held_rejoins
            .insert(hostname.to_string());
    }

    /// Number of listings a rejoining node stays absent for
    pub async fn set_rejoin_delay(&self, listings: u32) {
        self.state.write().await.rejoin_delay = listings;
    }

    /// Fail the next `times` calls of a read operation such as
    /// `get_node_status` or `version_on_node`
    pub async fn fail_reads(&self, operation: &str, times: u32) {
        self.state
            .write()
            .await
            .read_faults
            .insert(operation.to_string(), times);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn pool_reads(&self, pool_uuid: &str) -> usize {
        self.state
            .read()
            .await
            .pool_reads
            .get(pool_uuid)
            .copied()
            .unwrap_or(0)
    }

    /// Number of `get_nodes` calls served
    pub async fn listings(&self) -> usize {
        self.state.read().await.listings
    }

    pub async fn init_count(&self) -> usize {
        self.state.read().await.init_options.len()
    }

    pub async fn commands(&self) -> Vec<(String, String)> {
        self.state.read().await.commands.clone()
    }

    async fn record_init(&self, options: &InitOptions) {
        self.state.write().await.init_options.push(options.clone());
    }
}

fn unknown(operation: &str, what: impl std::fmt::Display) -> Error {
    Error::BackendOperationFailed {
        backend: SIM_DRIVER_NAME.to_string(),
        operation: operation.to_string(),
        reason: format!("{} not found", what),
    }
}

fn key(node: &Node) -> String {
    if node.hostname.is_empty() {
        node.name.clone()
    } else {
        node.hostname.clone()
    }
}

// =============================================================================
// Node Driver
// =============================================================================

/// Simulated node driver; commands always succeed on known nodes
pub struct SimNodeDriver {
    cluster: Arc<SimCluster>,
}

impl SimNodeDriver {
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        Self { cluster }
    }

    async fn known(&self, node: &Node, operation: &str) -> Result<()> {
        let state = self.cluster.state.read().await;
        if state.nodes.iter().any(|n| n.name == node.name) {
            Ok(())
        } else {
            Err(unknown(operation, format!("node {}", node.name)))
        }
    }
}

#[async_trait]
impl NodeDriver for SimNodeDriver {
    fn name(&self) -> &str {
        SIM_DRIVER_NAME
    }

    async fn init(&self, options: &InitOptions) -> Result<()> {
        self.cluster.record_init(options).await;
        Ok(())
    }

    async fn run_command(
        &self,
        node: &Node,
        command: &str,
        _options: &ConnectionOptions,
    ) -> Result<String> {
        self.known(node, "run_command").await?;
        debug!("Simulated command on {}: {}", node.name, command);
        self.cluster
            .state
            .write()
            .await
            .commands
            .push((node.name.clone(), command.to_string()));
        Ok(String::new())
    }

    async fn reboot_node(&self, node: &Node, options: &ConnectionOptions) -> Result<()> {
        self.run_command(node, "reboot", options).await.map(|_| ())
    }

    async fn test_connection(&self, node: &Node, _options: &ConnectionOptions) -> Result<()> {
        self.known(node, "test_connection").await
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Simulated scheduler; lists the cluster's nodes
pub struct SimScheduler {
    cluster: Arc<SimCluster>,
}

impl SimScheduler {
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl SchedulerDriver for SimScheduler {
    fn name(&self) -> &str {
        SIM_DRIVER_NAME
    }

    async fn init(&self, options: &InitOptions) -> Result<()> {
        self.cluster.record_init(options).await;
        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<Node>> {
        let mut state = self.cluster.state.write().await;
        state.listings += 1;

        let mut reappeared = Vec::new();
        for (hostname, pending) in state.pending_rejoins.iter_mut() {
            if let Some(remaining) = pending.remaining.as_mut() {
                if *remaining == 0 {
                    reappeared.push(hostname.clone());
                } else {
                    *remaining -= 1;
                }
            }
        }
        for hostname in reappeared {
            if let Some(pending) = state.pending_rejoins.remove(&hostname) {
                info!("Simulated node {} is listed again", hostname);
                state.nodes.push(pending.node);
            }
        }

        Ok(state.nodes.clone())
    }

    async fn prepare_node_to_decommission(&self, node: &Node) -> Result<()> {
        let state = self.cluster.state.read().await;
        if state.nodes.iter().any(|n| n.name == node.name) {
            Ok(())
        } else {
            Err(unknown("prepare_node_to_decommission", format!("node {}", node.name)))
        }
    }
}

// =============================================================================
// Volume Driver
// =============================================================================

/// Simulated storage driver
pub struct SimVolumeDriver {
    cluster: Arc<SimCluster>,
}

impl SimVolumeDriver {
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl VolumeDriver for SimVolumeDriver {
    fn name(&self) -> &str {
        SIM_DRIVER_NAME
    }

    async fn init(&self, options: &InitOptions) -> Result<()> {
        self.cluster.record_init(options).await;
        Ok(())
    }

    async fn expand_pool(
        &self,
        pool_uuid: &str,
        resize: ResizeType,
        new_size_gib: u64,
    ) -> Result<()> {
        let mut state = self.cluster.state.write().await;
        if !state.pools.contains_key(pool_uuid) {
            return Err(unknown("expand_pool", format!("pool {}", pool_uuid)));
        }
        info!(
            "Simulated {:?} expansion of pool {} to {} GiB",
            resize, pool_uuid, new_size_gib
        );
        state
            .pool_scripts
            .entry(pool_uuid.to_string())
            .or_insert_with(|| {
                Script::new([
                    PoolObservation::new(PoolOperationStatus::Pending, "queued", 0),
                    PoolObservation::new(PoolOperationStatus::InProgress, "resizing", 0),
                    PoolObservation::new(
                        PoolOperationStatus::Successful,
                        "resize complete",
                        new_size_gib,
                    ),
                ])
            });
        Ok(())
    }

    async fn get_storage_pool(&self, pool_uuid: &str) -> Result<Option<StoragePool>> {
        let mut state = self.cluster.state.write().await;
        state.take_fault("get_storage_pool")?;
        *state.pool_reads.entry(pool_uuid.to_string()).or_insert(0) += 1;

        let observation = state.pool_scripts.get_mut(pool_uuid).and_then(Script::next);
        let Some(pool) = state.pools.get_mut(pool_uuid) else {
            return Ok(None);
        };
        if let Some(observation) = observation {
            if observation.size_gib > 0 {
                pool.total_size_bytes = observation.size_gib * GIB;
            }
            pool.last_operation = Some(PoolOperation {
                status: observation.status,
                message: observation.message,
            });
        }
        Ok(Some(pool.clone()))
    }

    async fn decommission_node(&self, node: &Node) -> Result<()> {
        let mut state = self.cluster.state.write().await;
        let Some(index) = state.nodes.iter().position(|n| n.name == node.name) else {
            return Err(unknown("decommission_node", format!("node {}", node.name)));
        };
        let removed = state.nodes.remove(index);
        info!("Simulated decommission of {}", removed.name);
        state
            .node_status
            .entry(removed.name.clone())
            .or_insert_with(|| Script::new([NodeStatus::Decommissioning, NodeStatus::None]));
        Ok(())
    }

    async fn rejoin_node(&self, node: &Node) -> Result<()> {
        let mut state = self.cluster.state.write().await;
        let hostname = key(node);
        let remaining = if state.held_rejoins.contains(&hostname) {
            None
        } else {
            Some(state.rejoin_delay)
        };
        state.node_status.remove(&node.name);
        state.pending_rejoins.insert(
            hostname,
            PendingRejoin {
                remaining,
                node: node.without_identity(),
            },
        );
        Ok(())
    }

    async fn get_node_status(&self, node: &Node) -> Result<NodeStatus> {
        let mut state = self.cluster.state.write().await;
        state.take_fault("get_node_status")?;
        Ok(state
            .node_status
            .get_mut(&node.name)
            .and_then(Script::next)
            .unwrap_or(NodeStatus::Ok))
    }

    async fn is_driver_up(&self, node: &Node) -> Result<bool> {
        let mut state = self.cluster.state.write().await;
        state.take_fault("is_driver_up")?;
        Ok(state
            .driver_up
            .get_mut(&node.name)
            .and_then(Script::next)
            .unwrap_or(true))
    }

    async fn metadata_members(&self, _node: &Node) -> Result<Vec<MetadataMember>> {
        let mut state = self.cluster.state.write().await;
        state.take_fault("metadata_members")?;
        if let Some(script) = state.members.as_mut() {
            return Ok(script.next().unwrap_or_default());
        }
        Ok(state
            .nodes
            .iter()
            .filter(|n| n.is_metadata_node)
            .enumerate()
            .map(|(i, n)| MetadataMember {
                id: n.vol_driver_node_id.clone(),
                peer_urls: n.addresses.iter().map(|a| format!("http://{}:9018", a)).collect(),
                client_urls: n.addresses.iter().map(|a| format!("http://{}:9019", a)).collect(),
                leader: i == 0,
                db_size: 0,
                is_healthy: true,
            })
            .collect())
    }

    async fn start_upgrade(&self, tag: &str) -> Result<()> {
        let mut state = self.cluster.state.write().await;
        let names: Vec<String> = state
            .nodes
            .iter()
            .filter(|n| n.storage_driver_installed)
            .map(|n| n.name.clone())
            .collect();
        for name in names {
            state.versions.entry(name).or_insert_with(|| {
                Script::new([
                    DriverVersion {
                        version: SIM_BASE_VERSION.to_string(),
                        status: UpgradeStatus::InProgress,
                    },
                    DriverVersion {
                        version: format!("{}-sim", tag),
                        status: UpgradeStatus::Idle,
                    },
                ])
            });
        }
        info!("Simulated rolling upgrade to {}", tag);
        Ok(())
    }

    async fn version_on_node(&self, node: &Node) -> Result<DriverVersion> {
        let mut state = self.cluster.state.write().await;
        state.take_fault("version_on_node")?;
        Ok(state
            .versions
            .get_mut(&node.name)
            .and_then(Script::next)
            .unwrap_or_else(|| DriverVersion {
                version: SIM_BASE_VERSION.to_string(),
                status: UpgradeStatus::Idle,
            }))
    }
}

// =============================================================================
// Backup Driver
// =============================================================================

/// Simulated backup driver
pub struct SimBackupDriver {
    cluster: Arc<SimCluster>,
}

impl SimBackupDriver {
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl BackupDriver for SimBackupDriver {
    fn name(&self) -> &str {
        SIM_DRIVER_NAME
    }

    async fn init(&self, options: &InitOptions) -> Result<()> {
        self.cluster.record_init(options).await;
        Ok(())
    }

    async fn create_backup(&self, request: BackupRequest) -> Result<()> {
        let already_scripted = self
            .cluster
            .state
            .read()
            .await
            .backups
            .contains_key(&request.name);
        if !already_scripted {
            self.cluster
                .script_backup(
                    request,
                    vec![
                        (BackupStatus::Pending, ""),
                        (BackupStatus::InProgress, ""),
                        (BackupStatus::Success, ""),
                    ],
                )
                .await;
        }
        Ok(())
    }

    async fn inspect_backup(&self, name: &str) -> Result<BackupInfo> {
        let mut state = self.cluster.state.write().await;
        state
            .backups
            .get_mut(name)
            .and_then(|(_, script)| script.next())
            .ok_or_else(|| unknown("inspect_backup", format!("backup {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_last_value_sticks() {
        let mut script = Script::new([1, 2, 3]);
        assert_eq!(script.next(), Some(1));
        assert_eq!(script.next(), Some(2));
        assert_eq!(script.next(), Some(3));
        assert_eq!(script.next(), Some(3));

        let mut empty: Script<u8> = Script::new([]);
        assert_eq!(empty.next(), None);
    }

    #[tokio::test]
    async fn test_default_expansion_script() {
        let cluster = SimCluster::with_topology(1);
        let volume = SimVolumeDriver::new(cluster.clone());

        volume.expand_pool("pool-0", ResizeType::Auto, 200).await.unwrap();

        let first = volume.get_storage_pool("pool-0").await.unwrap().unwrap();
        assert_eq!(
            first.last_operation.unwrap().status,
            PoolOperationStatus::Pending
        );
        let _ = volume.get_storage_pool("pool-0").await.unwrap();
        let done = volume.get_storage_pool("pool-0").await.unwrap().unwrap();
        assert_eq!(done.total_size_gib(), 200);
        assert_eq!(cluster.pool_reads("pool-0").await, 3);

        assert!(volume.expand_pool("missing", ResizeType::Auto, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_decommission_and_rejoin_listing() {
        let cluster = SimCluster::with_topology(2);
        let scheduler = SimScheduler::new(cluster.clone());
        let volume = SimVolumeDriver::new(cluster.clone());
        let node = Node::worker("worker-1");

        volume.decommission_node(&node).await.unwrap();
        assert_eq!(scheduler.get_nodes().await.unwrap().len(), 2);
        assert_eq!(
            volume.get_node_status(&node).await.unwrap(),
            NodeStatus::Decommissioning
        );
        assert_eq!(volume.get_node_status(&node).await.unwrap(), NodeStatus::None);

        volume.rejoin_node(&node).await.unwrap();
        // absent for one listing, back on the next
        assert_eq!(scheduler.get_nodes().await.unwrap().len(), 2);
        assert_eq!(scheduler.get_nodes().await.unwrap().len(), 3);
        assert_eq!(volume.get_node_status(&node).await.unwrap(), NodeStatus::Ok);
    }

    #[tokio::test]
    async fn test_default_members_follow_metadata_nodes() {
        let cluster = SimCluster::with_topology(4);
        let volume = SimVolumeDriver::new(cluster);

        let members = volume.metadata_members(&Node::worker("worker-0")).await.unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members.iter().filter(|m| m.leader).count(), 1);
        assert!(members.iter().all(|m| m.is_healthy));
    }

    #[tokio::test]
    async fn test_unknown_backup() {
        let cluster = SimCluster::with_topology(0);
        let backup = SimBackupDriver::new(cluster);
        assert!(backup.inspect_backup("nope").await.is_err());
    }
}
