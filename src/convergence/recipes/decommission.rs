//! Node decommission
//!
//! `Active -> Decommissioning -> Decommissioned`

use super::converge_all;
use crate::convergence::{Attempt, Probe, Retrier};
use crate::domain::ports::{NodeStatus, SchedulerDriverRef, VolumeDriverRef};
use crate::error::{Error, Result};
use crate::nodes::Node;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Phase of a node decommission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecommissionState {
    Active,
    Decommissioning,
    Decommissioned,
}

impl std::fmt::Display for DecommissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecommissionState::Active => write!(f, "active"),
            DecommissionState::Decommissioning => write!(f, "decommissioning"),
            DecommissionState::Decommissioned => write!(f, "decommissioned"),
        }
    }
}

/// Probe for a node leaving the storage cluster
pub struct DecommissionProbe {
    driver: VolumeDriverRef,
    node: Node,
    state: DecommissionState,
}

impl DecommissionProbe {
    pub fn new(driver: VolumeDriverRef, node: Node) -> Self {
        Self {
            driver,
            node,
            state: DecommissionState::Active,
        }
    }

    pub fn state(&self) -> DecommissionState {
        self.state
    }

    fn transition(&mut self, next: DecommissionState) {
        if self.state != next {
            info!("Node {} {} -> {}", self.node.name, self.state, next);
            self.state = next;
        }
    }

    fn not_converged(&self, status: &NodeStatus) -> Error {
        Error::NotConverged {
            resource: self.node.resource(),
            state: self.state.to_string(),
            message: format!("storage status is {}", status),
        }
    }
}

#[async_trait]
impl Probe for DecommissionProbe {
    type Output = ();

    async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<()> {
        let status = match self.driver.get_node_status(&self.node).await {
            Ok(status) => status,
            Err(err) => return Attempt::from_backend_error(err),
        };
        debug!("Node {} storage status: {}", self.node.name, status);

        match status {
            NodeStatus::None => {
                self.transition(DecommissionState::Decommissioned);
                Attempt::Ready(())
            }
            NodeStatus::Decommissioning => {
                self.transition(DecommissionState::Decommissioning);
                Attempt::retry(self.not_converged(&status))
            }
            NodeStatus::Ok => Attempt::retry(self.not_converged(&status)),
            NodeStatus::Error(reason) => {
                warn!("Node {} decommission failed: {}", self.node.name, reason);
                Attempt::Fatal(Error::OperationFailed {
                    resource: self.node.resource(),
                    state: self.state.to_string(),
                    message: reason,
                })
            }
        }
    }
}

/// Wait until the storage backend no longer knows the node
pub async fn wait_for_decommission(driver: VolumeDriverRef, node: &Node, retrier: Retrier) -> Result<()> {
    retrier
        .for_resource(node.resource())
        .run(DecommissionProbe::new(driver, node.clone()))
        .await
}

/// Drain the node, ask the storage backend to remove it, and wait until it is gone
pub async fn decommission_node(
    scheduler: SchedulerDriverRef,
    driver: VolumeDriverRef,
    node: Node,
    retrier: Retrier,
) -> Result<()> {
    info!("Decommissioning node {}", node.name);
    scheduler.prepare_node_to_decommission(&node).await?;
    driver.decommission_node(&node).await?;
    wait_for_decommission(driver, &node, retrier).await?;
    info!("Node {} decommissioned", node.name);
    Ok(())
}

/// Decommission several nodes at once; results are in input order
pub async fn decommission_nodes(
    scheduler: SchedulerDriverRef,
    driver: VolumeDriverRef,
    nodes: Vec<Node>,
    retrier: Retrier,
) -> Vec<Result<()>> {
    converge_all(nodes.into_iter().map(|node| {
        decommission_node(scheduler.clone(), driver.clone(), node, retrier.clone())
    }))
    .await
}
