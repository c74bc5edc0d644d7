//! Per-category driver registries
//!
//! Bundles one registry per capability category. Built explicitly with a
//! constructor and passed to whatever needs it; there is no process-global
//! registration state.

use super::driver_registry::{DriverCategory, DriverRegistry};
use crate::domain::ports::{AppChart, BackupDriver, NodeDriver, SchedulerDriver, VolumeDriver};
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// Driver registries for every category
#[derive(Debug)]
pub struct DriverRegistries {
    pub node: DriverRegistry<dyn NodeDriver>,
    pub scheduler: DriverRegistry<dyn SchedulerDriver>,
    pub storage: DriverRegistry<dyn VolumeDriver>,
    pub backup: DriverRegistry<dyn BackupDriver>,
    /// Application charts; entries are replaced when specs are rescanned
    pub apps: DriverRegistry<AppChart>,
}

impl DriverRegistries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node_driver(&self, name: &str) -> Result<Arc<dyn NodeDriver>> {
        self.node.get(name)
    }

    pub fn scheduler(&self, name: &str) -> Result<Arc<dyn SchedulerDriver>> {
        self.scheduler.get(name)
    }

    pub fn volume_driver(&self, name: &str) -> Result<Arc<dyn VolumeDriver>> {
        self.storage.get(name)
    }

    pub fn backup_driver(&self, name: &str) -> Result<Arc<dyn BackupDriver>> {
        self.backup.get(name)
    }

    /// Charts that are currently enabled, in registration order
    pub fn enabled_apps(&self) -> Vec<Arc<AppChart>> {
        self.apps.get_all_matching(|chart| chart.enabled)
    }

    /// Insert or overwrite chart definitions after re-reading them from disk
    pub fn rescan_apps(&self, charts: impl IntoIterator<Item = AppChart>) -> Result<usize> {
        let mut count = 0;
        for chart in charts {
            debug!("Rescanned app chart {} {}", chart.name, chart.version);
            self.apps.replace(chart.name.clone(), Arc::new(chart))?;
            count += 1;
        }
        Ok(count)
    }
}

impl Default for DriverRegistries {
    fn default() -> Self {
        Self {
            node: DriverRegistry::new(DriverCategory::NodeControl),
            scheduler: DriverRegistry::new(DriverCategory::Scheduler),
            storage: DriverRegistry::new(DriverCategory::Storage),
            backup: DriverRegistry::new(DriverCategory::Backup),
            apps: DriverRegistry::replaceable(DriverCategory::Application),
        }
    }
}
