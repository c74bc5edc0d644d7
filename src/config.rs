//! Harness Configuration
//!
//! Driver selection and per-recipe polling windows, loadable from YAML.

use crate::convergence::Retrier;
use crate::domain::ports::InitOptions;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Retry Window
// =============================================================================

/// Timeout and polling interval for one kind of convergence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryWindow {
    pub timeout_secs: u64,
    pub interval_secs: u64,
}

impl RetryWindow {
    pub const fn new(timeout_secs: u64, interval_secs: u64) -> Self {
        Self {
            timeout_secs,
            interval_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retrier polling with this window
    pub fn retrier(&self) -> Retrier {
        Retrier::new(self.timeout(), self.interval())
    }
}

impl Default for RetryWindow {
    fn default() -> Self {
        Self::new(120, 10)
    }
}

/// Polling windows for every convergence recipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub pool_expansion: RetryWindow,
    pub decommission: RetryWindow,
    pub rejoin: RetryWindow,
    pub driver_up: RetryWindow,
    pub membership: RetryWindow,
    pub upgrade: RetryWindow,
    pub backup: RetryWindow,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            pool_expansion: RetryWindow::new(120 * 60, 30),
            decommission: RetryWindow::default(),
            rejoin: RetryWindow::default(),
            driver_up: RetryWindow::new(10 * 60, 10),
            membership: RetryWindow::new(5 * 60, 10),
            upgrade: RetryWindow::new(20 * 60, 30),
            backup: RetryWindow::new(60 * 60, 30),
        }
    }
}

impl ConvergenceConfig {
    /// Poll every recipe at the same interval
    pub fn set_interval(&mut self, interval_secs: u64) {
        for window in [
            &mut self.pool_expansion,
            &mut self.decommission,
            &mut self.rejoin,
            &mut self.driver_up,
            &mut self.membership,
            &mut self.upgrade,
            &mut self.backup,
        ] {
            window.interval_secs = interval_secs;
        }
    }

    fn windows(&self) -> [(&'static str, RetryWindow); 7] {
        [
            ("pool_expansion", self.pool_expansion),
            ("decommission", self.decommission),
            ("rejoin", self.rejoin),
            ("driver_up", self.driver_up),
            ("membership", self.membership),
            ("upgrade", self.upgrade),
            ("backup", self.backup),
        ]
    }
}

// =============================================================================
// Driver Selection
// =============================================================================

/// Names of the drivers to use, one per category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSelection {
    pub node: String,
    pub scheduler: String,
    pub storage: String,
    /// Backup driver, if the run needs one
    pub backup: Option<String>,
}

impl Default for DriverSelection {
    fn default() -> Self {
        Self {
            node: "sim".to_string(),
            scheduler: "sim".to_string(),
            storage: "sim".to_string(),
            backup: None,
        }
    }
}

// =============================================================================
// Harness Configuration
// =============================================================================

/// Top-level harness configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub drivers: DriverSelection,
    /// Auth token passed to every driver's init
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    /// Directory holding application specs
    pub spec_dir: Option<String>,
    /// Space reserved for the journal when a pool has one, in GiB
    pub journal_reserve_gib: u64,
    pub convergence: ConvergenceConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            drivers: DriverSelection::default(),
            auth_token: None,
            spec_dir: None,
            journal_reserve_gib: 3,
            convergence: ConvergenceConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: HarnessConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        for (category, name) in [
            ("node", &self.drivers.node),
            ("scheduler", &self.drivers.scheduler),
            ("storage", &self.drivers.storage),
        ] {
            if name.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "{} driver name must not be empty",
                    category
                )));
            }
        }
        if matches!(&self.drivers.backup, Some(name) if name.trim().is_empty()) {
            return Err(Error::Configuration(
                "backup driver name must not be empty".to_string(),
            ));
        }

        for (name, window) in self.convergence.windows() {
            if window.interval_secs == 0 && window.timeout_secs > 0 {
                return Err(Error::Configuration(format!(
                    "{} interval must be positive when a timeout is set",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Options handed to every driver's init
    pub fn init_options(&self) -> InitOptions {
        InitOptions {
            node_driver: Some(self.drivers.node.clone()),
            scheduler: Some(self.drivers.scheduler.clone()),
            volume_driver: Some(self.drivers.storage.clone()),
            backup_driver: self.drivers.backup.clone(),
            token: self.auth_token.clone(),
            spec_dir: self.spec_dir.clone(),
        }
    }
}
