//! Storage driver version upgrade
//!
//! Backends append build suffixes to the version they report, so a node is
//! upgraded once its reported version starts with the `major.minor.patch`
//! family of the target tag and the patch number ends there.

use crate::convergence::{Attempt, Probe, Retrier};
use crate::domain::ports::{UpgradeStatus, VolumeDriverRef};
use crate::error::{Error, Result};
use crate::nodes::{Node, NodeRegistry};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Leading `major.minor.patch` of a version tag, if it has one
pub fn version_family(tag: &str) -> Option<&str> {
    let bytes = tag.as_bytes();
    let mut pos = 0;
    for part in 0..3 {
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == start {
            return None;
        }
        if part < 2 {
            if bytes.get(pos) != Some(&b'.') {
                return None;
            }
            pos += 1;
        }
    }
    Some(&tag[..pos])
}

/// Whether a reported version belongs to a family: `3.2.1-c0ffee` is in
/// `3.2.1`, `3.2.10` is not
pub fn in_family(version: &str, family: &str) -> bool {
    version
        .strip_prefix(family)
        .map_or(false, |rest| !rest.starts_with(|c: char| c.is_ascii_digit()))
}

/// Probe for one node running the target version
pub struct UpgradeProbe {
    driver: VolumeDriverRef,
    node: Node,
    target_tag: String,
}

impl UpgradeProbe {
    pub fn new(driver: VolumeDriverRef, node: Node, target_tag: impl Into<String>) -> Self {
        Self {
            driver,
            node,
            target_tag: target_tag.into(),
        }
    }
}

#[async_trait]
impl Probe for UpgradeProbe {
    type Output = String;

    async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<String> {
        let Some(family) = version_family(&self.target_tag) else {
            return Attempt::Fatal(Error::Configuration(format!(
                "cannot read a version from upgrade tag {}",
                self.target_tag
            )));
        };

        let reported = match self.driver.version_on_node(&self.node).await {
            Ok(reported) => reported,
            Err(err) => return Attempt::from_backend_error(err),
        };
        debug!(
            "Node {} runs {} ({:?})",
            self.node.name, reported.version, reported.status
        );

        match reported.status {
            UpgradeStatus::Failed(reason) => {
                warn!("Upgrade failed on {}: {}", self.node.name, reason);
                Attempt::Fatal(Error::OperationFailed {
                    resource: self.node.resource(),
                    state: "upgrade-failed".to_string(),
                    message: reason,
                })
            }
            UpgradeStatus::Idle if in_family(&reported.version, family) => {
                Attempt::Ready(reported.version)
            }
            status => {
                let state = match status {
                    UpgradeStatus::InProgress => "upgrading",
                    _ => "outdated",
                };
                Attempt::retry(Error::NotConverged {
                    resource: self.node.resource(),
                    state: state.to_string(),
                    message: format!(
                        "node runs {}, waiting for {}",
                        reported.version, family
                    ),
                })
            }
        }
    }
}

/// Wait until a node runs the target version; returns the reported version
pub async fn wait_for_upgrade(
    driver: VolumeDriverRef,
    node: &Node,
    target_tag: &str,
    retrier: Retrier,
) -> Result<String> {
    let version = retrier
        .for_resource(node.resource())
        .run(UpgradeProbe::new(driver, node.clone(), target_tag))
        .await?;
    info!("Node {} upgraded to {}", node.name, version);
    Ok(version)
}

/// Start an upgrade and wait for every storage driver node in turn.
///
/// Returns `(node name, reported version)` pairs in registry order. Stops at
/// the first node that does not converge.
pub async fn rolling_upgrade(
    driver: VolumeDriverRef,
    registry: &NodeRegistry,
    target_tag: &str,
    retrier: Retrier,
) -> Result<Vec<(String, String)>> {
    if version_family(target_tag).is_none() {
        return Err(Error::Configuration(format!(
            "cannot read a version from upgrade tag {}",
            target_tag
        )));
    }

    info!("Starting rolling upgrade to {}", target_tag);
    driver.start_upgrade(target_tag).await?;

    let mut upgraded = Vec::new();
    for node in registry.storage_driver_nodes() {
        let version = wait_for_upgrade(driver.clone(), &node, target_tag, retrier.clone()).await?;
        upgraded.push((node.name, version));
    }
    Ok(upgraded)
}
