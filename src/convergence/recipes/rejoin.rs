//! Node rejoin
//!
//! `Decommissioned -> Rejoining -> Active`
//!
//! The node's registry identity does not survive a decommission. The probe
//! watches the scheduler's listing for the node's hostname; only once it is
//! back is the node re-registered, under a fresh identity, and only then does
//! the wait for its storage driver start.

use crate::convergence::{Attempt, Probe, Retrier};
use crate::domain::ports::{SchedulerDriverRef, VolumeDriverRef};
use crate::error::{Error, Result};
use crate::nodes::{Node, NodeRegistry};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Phase of a node rejoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejoinState {
    Decommissioned,
    Rejoining,
    Active,
}

impl std::fmt::Display for RejoinState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejoinState::Decommissioned => write!(f, "decommissioned"),
            RejoinState::Rejoining => write!(f, "rejoining"),
            RejoinState::Active => write!(f, "active"),
        }
    }
}

/// Stable identity used to recognise a node across decommission and rejoin
fn stable_identity(node: &Node) -> &str {
    if node.hostname.is_empty() {
        &node.name
    } else {
        &node.hostname
    }
}

/// Probe that waits for a node to reappear in the scheduler's listing
pub struct RejoinProbe {
    scheduler: SchedulerDriverRef,
    hostname: String,
    resource: String,
    state: RejoinState,
}

impl RejoinProbe {
    pub fn new(scheduler: SchedulerDriverRef, node: &Node) -> Self {
        Self {
            scheduler,
            hostname: stable_identity(node).to_string(),
            resource: node.resource(),
            state: RejoinState::Decommissioned,
        }
    }

    pub fn state(&self) -> RejoinState {
        self.state
    }

    fn transition(&mut self, next: RejoinState) {
        if self.state != next {
            info!("Node {} {} -> {}", self.hostname, self.state, next);
            self.state = next;
        }
    }
}

#[async_trait]
impl Probe for RejoinProbe {
    type Output = Node;

    async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<Node> {
        self.transition(RejoinState::Rejoining);

        let listed = match self.scheduler.get_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => return Attempt::from_backend_error(err),
        };
        debug!("Scheduler lists {} nodes", listed.len());

        match listed.into_iter().find(|n| stable_identity(n) == self.hostname) {
            Some(node) => {
                self.transition(RejoinState::Active);
                Attempt::Ready(node.without_identity())
            }
            None => Attempt::retry(Error::NotConverged {
                resource: self.resource.clone(),
                state: self.state.to_string(),
                message: format!("{} is not listed by the scheduler", self.hostname),
            }),
        }
    }
}

/// Probe for the storage driver serving on a node
pub struct DriverUpProbe {
    driver: VolumeDriverRef,
    node: Node,
}

impl DriverUpProbe {
    pub fn new(driver: VolumeDriverRef, node: Node) -> Self {
        Self { driver, node }
    }
}

#[async_trait]
impl Probe for DriverUpProbe {
    type Output = ();

    async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<()> {
        match self.driver.is_driver_up(&self.node).await {
            Ok(true) => Attempt::Ready(()),
            Ok(false) => Attempt::retry(Error::NotConverged {
                resource: self.node.resource(),
                state: "driver-down".to_string(),
                message: format!("{} driver is not up yet", self.driver.name()),
            }),
            Err(err) => Attempt::from_backend_error(err),
        }
    }
}

/// Wait until the storage driver is up on a node
pub async fn wait_for_driver_up(driver: VolumeDriverRef, node: &Node, retrier: Retrier) -> Result<()> {
    retrier
        .for_resource(node.resource())
        .run(DriverUpProbe::new(driver, node.clone()))
        .await?;
    info!("Storage driver is up on {}", node.name);
    Ok(())
}

/// Wait for a node to be listed again and return the listed record
pub async fn wait_for_rejoin(scheduler: SchedulerDriverRef, node: &Node, retrier: Retrier) -> Result<Node> {
    retrier
        .for_resource(node.resource())
        .run(RejoinProbe::new(scheduler, node))
        .await
}

/// Retry windows for the two phases of a rejoin
#[derive(Debug, Clone)]
pub struct RejoinWindows {
    pub rejoin: Retrier,
    pub driver_up: Retrier,
}

/// Bring a decommissioned node back.
///
/// Asks the storage backend to rejoin the node, waits for the scheduler to
/// list it again, swaps the stale registry record for the listed one, and
/// waits for the storage driver to come up. Returns the newly registered
/// record.
pub async fn rejoin_node(
    scheduler: SchedulerDriverRef,
    driver: VolumeDriverRef,
    registry: &NodeRegistry,
    node: &Node,
    windows: RejoinWindows,
) -> Result<Node> {
    info!("Rejoining node {}", node.name);
    driver.rejoin_node(node).await?;

    let listed = wait_for_rejoin(scheduler, node, windows.rejoin).await?;

    if node.uuid().is_some() {
        registry.delete_node(node)?;
    }
    let registered = registry.add_node(listed)?;

    wait_for_driver_up(driver, &registered, windows.driver_up).await?;
    Ok(registered)
}
