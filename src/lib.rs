//! Converge Harness - driver registries and convergence engine for
//! infrastructure test automation
//!
//! Lets a test scenario pick concrete backends by name, keeps a
//! concurrency-safe inventory of the nodes under test, and waits for
//! long-running infrastructure operations to reach a terminal state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                  Harness                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Driver          │  │  Node Registry  │  │   Convergence Recipes       │  │
//! │  │ Registries      │  │  (RwLock map)   │  │   expand / decommission /   │  │
//! │  │ (per category)  │  │                 │  │   rejoin / quorum / upgrade │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           │                    │             ┌───────────┴───────────┐       │
//! │           │                    │             │     Retry Engine      │       │
//! │           │                    │             │ (timeout + interval)  │       │
//! │           │                    │             └───────────────────────┘       │
//! ├───────────┴────────────────────┴─────────────────────────────────────────────┤
//! │                             Capability Ports                                 │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────┐  ┌────────────────────┐  │
//! │  │    Node    │  │ Scheduler  │  │ Storage        │  │      Backup        │  │
//! │  │   Driver   │  │   Driver   │  │ (VolumeDriver) │  │      Driver        │  │
//! │  └────────────┘  └────────────┘  └────────────────┘  └────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Name-keyed driver registries, one per capability category
//! - [`nodes`]: Node record and the node registry
//! - [`convergence`]: Retry engine and the operation recipes built on it
//! - [`domain`]: Capability ports every driver implements
//! - [`drivers`]: Built-in in-memory drivers
//! - [`harness`]: Driver resolution and recipe entry points
//! - [`config`]: YAML configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod convergence;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod harness;
pub mod nodes;
pub mod registry;

// Re-export commonly used types
pub use config::{ConvergenceConfig, DriverSelection, HarnessConfig, RetryWindow};

pub use convergence::{
    converge_all, do_retry_with_timeout, probe_fn, Attempt, FnProbe, Probe, Retrier,
};

pub use domain::ports::{
    AppChart, BackupDriver, BackupInfo, BackupRequest, BackupStatus, ConnectionOptions,
    DriverVersion, InitOptions, MetadataMember, NodeDriver, NodeStatus, SchedulerDriver,
    UpgradeStatus, VolumeDriver,
};

pub use drivers::{register_builtin, SimCluster, SIM_DRIVER_NAME};

pub use error::{Error, ErrorClass, Result};

pub use harness::{Harness, HarnessStatus};

pub use nodes::{
    Node, NodeId, NodeRegistry, NodeType, PoolOperation, PoolOperationStatus, RegistryEvent,
    ResizeType, StoragePool,
};

pub use registry::{DriverCategory, DriverRegistries, DriverRegistry, RegistrationPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
