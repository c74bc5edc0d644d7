//! Harness - wires configuration, drivers and the node inventory together
//!
//! Resolves the configured driver for every category, initializes them,
//! discovers the infrastructure into the node registry and exposes the
//! convergence recipes with the configured polling windows.

use crate::config::{HarnessConfig, RetryWindow};
use crate::convergence::recipes::{self, has_journal, RejoinWindows};
use crate::convergence::Retrier;
use crate::domain::ports::{
    AppChart, BackupDriverRef, BackupInfo, BackupRequest, MetadataMember, NodeDriverRef,
    SchedulerDriverRef, VolumeDriverRef,
};
use crate::error::{Error, Result};
use crate::nodes::{Node, NodeRegistry, ResizeType, StoragePool};
use crate::registry::DriverRegistries;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Status
// =============================================================================

/// Snapshot of the harness state
#[derive(Debug, Clone, Serialize)]
pub struct HarnessStatus {
    pub node_driver: String,
    pub scheduler: String,
    pub storage_driver: String,
    pub backup_driver: Option<String>,
    pub total_nodes: usize,
    pub storage_nodes: usize,
    pub metadata_nodes: usize,
    pub enabled_apps: usize,
}

// =============================================================================
// Harness
// =============================================================================

/// Initialized drivers plus the node inventory they operate on
pub struct Harness {
    config: HarnessConfig,
    drivers: Arc<DriverRegistries>,
    nodes: Arc<NodeRegistry>,
    node_driver: NodeDriverRef,
    scheduler: SchedulerDriverRef,
    storage: VolumeDriverRef,
    backup: Option<BackupDriverRef>,
    shutdown: CancellationToken,
}

impl Harness {
    /// Resolve and initialize the configured drivers, then discover nodes.
    ///
    /// An unknown driver name is a configuration error.
    pub async fn init(config: HarnessConfig, drivers: Arc<DriverRegistries>) -> Result<Arc<Self>> {
        config.validate()?;
        info!("Initializing harness");

        let node_driver = drivers.node_driver(&config.drivers.node)?;
        let scheduler = drivers.scheduler(&config.drivers.scheduler)?;
        let storage = drivers.volume_driver(&config.drivers.storage)?;
        let backup = match &config.drivers.backup {
            Some(name) => Some(drivers.backup_driver(name)?),
            None => None,
        };

        let options = config.init_options();
        node_driver.init(&options).await?;
        scheduler.init(&options).await?;
        storage.init(&options).await?;
        if let Some(backup) = &backup {
            backup.init(&options).await?;
        }
        info!(
            "Drivers initialized: node={}, scheduler={}, storage={}",
            node_driver.name(),
            scheduler.name(),
            storage.name()
        );

        let harness = Arc::new(Self {
            config,
            drivers,
            nodes: NodeRegistry::new(),
            node_driver,
            scheduler,
            storage,
            backup,
            shutdown: CancellationToken::new(),
        });

        let discovered = harness.rediscover().await?;
        info!("Harness initialized with {} nodes", discovered);

        if let Some(dir) = harness.config.spec_dir.clone() {
            harness.rescan_apps(dir)?;
        }
        Ok(harness)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn drivers(&self) -> &Arc<DriverRegistries> {
        &self.drivers
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn node_driver(&self) -> &NodeDriverRef {
        &self.node_driver
    }

    pub fn scheduler(&self) -> &SchedulerDriverRef {
        &self.scheduler
    }

    pub fn volume_driver(&self) -> &VolumeDriverRef {
        &self.storage
    }

    /// The backup driver, if one is configured
    pub fn backup_driver(&self) -> Result<&BackupDriverRef> {
        self.backup
            .as_ref()
            .ok_or_else(|| Error::Configuration("no backup driver configured".to_string()))
    }

    /// Abort every wait in progress; later waits end immediately
    pub fn shutdown(&self) {
        info!("Cancelling pending convergence waits");
        self.shutdown.cancel();
    }

    fn retrier(&self, window: RetryWindow) -> Retrier {
        window.retrier().with_cancellation(self.shutdown.child_token())
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Replace the node registry contents with the scheduler's listing
    pub async fn rediscover(&self) -> Result<usize> {
        let listed = self.scheduler.get_nodes().await?;
        let added = self.nodes.refresh(listed)?;
        debug!("Discovered {} nodes via {}", added.len(), self.scheduler.name());
        Ok(added.len())
    }

    /// Re-read application charts from a directory of YAML files
    pub fn rescan_apps(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for ext in ["yaml", "yml"] {
            let pattern = dir.join(format!("*.{}", ext));
            let pattern = pattern.to_str().ok_or_else(|| {
                Error::Configuration(format!("spec dir {} is not valid UTF-8", dir.display()))
            })?;
            let entries = glob::glob(pattern)
                .map_err(|e| Error::Configuration(format!("invalid spec dir pattern: {}", e)))?;
            for entry in entries {
                paths.push(entry.map_err(|e| Error::Io(e.into()))?);
            }
        }
        paths.sort();

        let mut charts = Vec::with_capacity(paths.len());
        for path in &paths {
            let chart: AppChart = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;
            charts.push(chart);
        }
        let count = self.drivers.rescan_apps(charts)?;
        info!("Loaded {} app charts from {}", count, dir.display());
        Ok(count)
    }

    pub fn status(&self) -> HarnessStatus {
        HarnessStatus {
            node_driver: self.node_driver.name().to_string(),
            scheduler: self.scheduler.name().to_string(),
            storage_driver: self.storage.name().to_string(),
            backup_driver: self.backup.as_ref().map(|b| b.name().to_string()),
            total_nodes: self.nodes.len(),
            storage_nodes: self.nodes.storage_nodes().len(),
            metadata_nodes: self.nodes.metadata_nodes().len(),
            enabled_apps: self.drivers.enabled_apps().len(),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Grow a pool and wait for the backend to report the new size
    pub async fn expand_pool(
        &self,
        pool_uuid: &str,
        resize: ResizeType,
        new_size_gib: u64,
    ) -> Result<StoragePool> {
        let journal = self
            .nodes
            .storage_nodes()
            .iter()
            .flat_map(|n| n.pools.iter())
            .find(|p| p.uuid == pool_uuid)
            .map(has_journal)
            .unwrap_or(false);
        let reserve = if journal { self.config.journal_reserve_gib } else { 0 };

        recipes::expand_pool(
            self.storage.clone(),
            pool_uuid,
            resize,
            new_size_gib,
            reserve,
            self.retrier(self.config.convergence.pool_expansion),
        )
        .await
    }

    /// Decommission a registered node and drop it from the registry
    pub async fn decommission(&self, name: &str) -> Result<Node> {
        let node = self.nodes.node_by_name(name)?;
        recipes::decommission_node(
            self.scheduler.clone(),
            self.storage.clone(),
            node.clone(),
            self.retrier(self.config.convergence.decommission),
        )
        .await?;
        self.nodes.delete_node(&node)?;
        Ok(node)
    }

    /// Decommission several registered nodes concurrently.
    ///
    /// Every node that converged is dropped from the registry; the results
    /// are in input order.
    pub async fn decommission_all(&self, names: &[&str]) -> Result<Vec<Result<Node>>> {
        let nodes = names
            .iter()
            .map(|name| self.nodes.node_by_name(name))
            .collect::<Result<Vec<_>>>()?;

        let results = recipes::decommission_nodes(
            self.scheduler.clone(),
            self.storage.clone(),
            nodes.clone(),
            self.retrier(self.config.convergence.decommission),
        )
        .await;

        let mut outcomes = Vec::with_capacity(nodes.len());
        for (node, result) in nodes.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    self.nodes.delete_node(&node)?;
                    outcomes.push(Ok(node));
                }
                Err(err) => {
                    warn!("Node {} did not decommission: {}", node.name, err);
                    outcomes.push(Err(err));
                }
            }
        }
        Ok(outcomes)
    }

    /// Bring a decommissioned node back; returns its new registry record
    pub async fn rejoin(&self, node: &Node) -> Result<Node> {
        recipes::rejoin_node(
            self.scheduler.clone(),
            self.storage.clone(),
            &self.nodes,
            node,
            RejoinWindows {
                rejoin: self.retrier(self.config.convergence.rejoin),
                driver_up: self.retrier(self.config.convergence.driver_up),
            },
        )
        .await
    }

    /// Wait for the metadata store to cover every registered metadata node
    pub async fn wait_for_membership(&self) -> Result<Vec<MetadataMember>> {
        let metadata_nodes = self.nodes.metadata_nodes();
        let observer = metadata_nodes
            .first()
            .cloned()
            .ok_or_else(|| Error::Configuration("no metadata nodes registered".to_string()))?;

        recipes::wait_for_membership(
            self.storage.clone(),
            &observer,
            metadata_nodes.len(),
            self.retrier(self.config.convergence.membership),
        )
        .await
    }

    /// Upgrade the storage driver on every storage driver node
    pub async fn upgrade(&self, tag: &str) -> Result<Vec<(String, String)>> {
        recipes::rolling_upgrade(
            self.storage.clone(),
            &self.nodes,
            tag,
            self.retrier(self.config.convergence.upgrade),
        )
        .await
    }

    /// Create a backup with the configured backup driver and wait for it
    pub async fn backup(&self, request: BackupRequest) -> Result<BackupInfo> {
        let driver = self.backup_driver()?.clone();
        recipes::create_backup(driver, request, self.retrier(self.config.convergence.backup)).await
    }
}
