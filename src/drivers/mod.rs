//! Built-in Drivers
//!
//! Backends that ship with the harness. Registration is explicit: callers
//! hand a [`DriverRegistries`] to [`register_builtin`].

pub mod sim;

pub use sim::{
    PoolObservation, SimBackupDriver, SimCluster, SimNodeDriver, SimScheduler, SimVolumeDriver,
    SIM_DRIVER_NAME,
};

use crate::error::Result;
use crate::registry::DriverRegistries;
use std::sync::Arc;
use tracing::debug;

/// Register the simulated drivers for every category, all backed by `cluster`
pub fn register_builtin(registries: &DriverRegistries, cluster: Arc<SimCluster>) -> Result<()> {
    registries
        .node
        .register(SIM_DRIVER_NAME, Arc::new(SimNodeDriver::new(cluster.clone())))?;
    registries
        .scheduler
        .register(SIM_DRIVER_NAME, Arc::new(SimScheduler::new(cluster.clone())))?;
    registries
        .storage
        .register(SIM_DRIVER_NAME, Arc::new(SimVolumeDriver::new(cluster.clone())))?;
    registries
        .backup
        .register(SIM_DRIVER_NAME, Arc::new(SimBackupDriver::new(cluster)))?;

    debug!("Registered built-in {} drivers", SIM_DRIVER_NAME);
    Ok(())
}
