//! Domain Ports - Capability contracts for every driver category
//!
//! These traits define the boundary between the harness and the concrete
//! backends (ssh, cloud APIs, schedulers, storage and backup products).
//! Each category is independent: a node driver has nothing in common with a
//! storage driver beyond `name()` and `init()`.

use crate::error::Result;
use crate::nodes::{Node, ResizeType, StoragePool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Driver Initialization
// =============================================================================

/// Cross-cutting configuration handed to every driver's `init`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitOptions {
    /// Name of the node driver in use
    pub node_driver: Option<String>,
    /// Name of the scheduler driver in use
    pub scheduler: Option<String>,
    /// Name of the storage driver in use
    pub volume_driver: Option<String>,
    /// Name of the backup driver in use
    pub backup_driver: Option<String>,
    /// Auth token for backends that need one
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Directory holding application specs
    pub spec_dir: Option<String>,
}

// =============================================================================
// Node Control Port
// =============================================================================

/// Options for commands run against a node
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub timeout: Duration,
    pub retry_interval: Duration,
    /// Treat a non-zero exit status as success
    pub ignore_error: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry_interval: Duration::from_secs(10),
            ignore_error: false,
        }
    }
}

/// Port for node lifecycle operations
#[async_trait]
pub trait NodeDriver: Send + Sync {
    /// Driver name
    fn name(&self) -> &str;

    async fn init(&self, options: &InitOptions) -> Result<()>;

    /// Run a shell command on a node and return its output
    async fn run_command(
        &self,
        node: &Node,
        command: &str,
        options: &ConnectionOptions,
    ) -> Result<String>;

    async fn reboot_node(&self, node: &Node, options: &ConnectionOptions) -> Result<()>;

    async fn test_connection(&self, node: &Node, options: &ConnectionOptions) -> Result<()>;
}

// =============================================================================
// Scheduler Port
// =============================================================================

/// Port for workload scheduler operations
#[async_trait]
pub trait SchedulerDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, options: &InitOptions) -> Result<()>;

    /// Authoritative listing of the infrastructure, without registry identities
    async fn get_nodes(&self) -> Result<Vec<Node>>;

    /// Drain / cordon a node ahead of its removal
    async fn prepare_node_to_decommission(&self, node: &Node) -> Result<()>;
}

// =============================================================================
// Storage Port
// =============================================================================

/// Storage status of a node as seen by the storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    /// Node is an active cluster member
    Ok,
    /// Node is being removed
    Decommissioning,
    /// Node is no longer known to the backend
    None,
    /// Backend reports a failure on this node
    Error(String),
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ok => write!(f, "ok"),
            NodeStatus::Decommissioning => write!(f, "decommissioning"),
            NodeStatus::None => write!(f, "none"),
            NodeStatus::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// One member of the internal metadata / quorum store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMember {
    pub id: String,
    #[serde(default)]
    pub peer_urls: Vec<String>,
    #[serde(default)]
    pub client_urls: Vec<String>,
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub db_size: u64,
    pub is_healthy: bool,
}

/// Upgrade progress reported by the storage driver on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeStatus {
    Idle,
    InProgress,
    Failed(String),
}

/// Version of the storage driver running on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverVersion {
    /// Reported version, possibly with a build suffix
    pub version: String,
    pub status: UpgradeStatus,
}

/// Port for storage (volume driver) operations
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, options: &InitOptions) -> Result<()>;

    /// Begin growing a pool to `new_size_gib`; completes asynchronously
    async fn expand_pool(&self, pool_uuid: &str, resize: ResizeType, new_size_gib: u64)
        -> Result<()>;

    /// Current state of a pool, `None` if the backend does not know it
    async fn get_storage_pool(&self, pool_uuid: &str) -> Result<Option<StoragePool>>;

    /// Begin removing a node from the storage cluster
    async fn decommission_node(&self, node: &Node) -> Result<()>;

    /// Begin re-adding a previously decommissioned node
    async fn rejoin_node(&self, node: &Node) -> Result<()>;

    async fn get_node_status(&self, node: &Node) -> Result<NodeStatus>;

    /// Whether the storage driver is up and serving on a node
    async fn is_driver_up(&self, node: &Node) -> Result<bool>;

    /// Metadata store membership as seen from `node`
    async fn metadata_members(&self, node: &Node) -> Result<Vec<MetadataMember>>;

    /// Begin a rolling upgrade to the given version tag
    async fn start_upgrade(&self, tag: &str) -> Result<()>;

    async fn version_on_node(&self, node: &Node) -> Result<DriverVersion>;
}

// =============================================================================
// Backup Port
// =============================================================================

/// Status of a backup as reported by the backup product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Success,
    PartialSuccess,
    Failed,
    Aborted,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupStatus::Pending => write!(f, "pending"),
            BackupStatus::InProgress => write!(f, "in-progress"),
            BackupStatus::Success => write!(f, "success"),
            BackupStatus::PartialSuccess => write!(f, "partial-success"),
            BackupStatus::Failed => write!(f, "failed"),
            BackupStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Request to create a backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    pub name: String,
    pub cluster: String,
    pub namespaces: Vec<String>,
    pub backup_location: String,
}

/// Backup as reported by the backup product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub status: BackupStatus,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Port for backup operations
#[async_trait]
pub trait BackupDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, options: &InitOptions) -> Result<()>;

    async fn create_backup(&self, request: BackupRequest) -> Result<()>;

    async fn inspect_backup(&self, name: &str) -> Result<BackupInfo>;
}

// =============================================================================
// Application Charts
// =============================================================================

/// Application definition deployable by a scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppChart {
    pub name: String,
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Manifest file names relative to the spec directory
    #[serde(default)]
    pub manifests: Vec<String>,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type NodeDriverRef = Arc<dyn NodeDriver>;
pub type SchedulerDriverRef = Arc<dyn SchedulerDriver>;
pub type VolumeDriverRef = Arc<dyn VolumeDriver>;
pub type BackupDriverRef = Arc<dyn BackupDriver>;
