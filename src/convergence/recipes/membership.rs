//! Metadata store membership
//!
//! Converged means the expected number of members is present, every member
//! is healthy and the elected leader, if there is one, is healthy. Anything
//! short of that is still converging.

use crate::convergence::{Attempt, Probe, Retrier};
use crate::domain::ports::{MetadataMember, VolumeDriverRef};
use crate::error::{Error, Result};
use crate::nodes::Node;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Resource label for membership waits
pub const METADATA_STORE: &str = "metadata-store";

/// Why a membership observation is not yet converged
fn shortfall(members: &[MetadataMember], expected: usize) -> Option<String> {
    if members.len() != expected {
        return Some(format!("found {} of {} members", members.len(), expected));
    }

    let leaders: Vec<&MetadataMember> = members.iter().filter(|m| m.leader).collect();
    if leaders.len() > 1 {
        return Some(format!("{} members claim leadership", leaders.len()));
    }
    if let Some(leader) = leaders.first() {
        if !leader.is_healthy {
            return Some(format!("leader {} is unhealthy", leader.id));
        }
    }

    let unhealthy: Vec<&str> = members
        .iter()
        .filter(|m| !m.is_healthy)
        .map(|m| m.id.as_str())
        .collect();
    if !unhealthy.is_empty() {
        return Some(format!("unhealthy members: {}", unhealthy.join(", ")));
    }
    None
}

/// Probe for the metadata store reaching a healthy, full membership
pub struct MembershipProbe {
    driver: VolumeDriverRef,
    observer: Node,
    expected_members: usize,
}

impl MembershipProbe {
    /// `observer` is the node the membership is read from
    pub fn new(driver: VolumeDriverRef, observer: Node, expected_members: usize) -> Self {
        Self {
            driver,
            observer,
            expected_members,
        }
    }
}

#[async_trait]
impl Probe for MembershipProbe {
    type Output = Vec<MetadataMember>;

    async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<Vec<MetadataMember>> {
        let members = match self.driver.metadata_members(&self.observer).await {
            Ok(members) => members,
            Err(err) => return Attempt::from_backend_error(err),
        };
        debug!(
            "Metadata store reports {} members via {}",
            members.len(),
            self.observer.name
        );

        match shortfall(&members, self.expected_members) {
            None => Attempt::Ready(members),
            Some(message) => Attempt::retry(Error::NotConverged {
                resource: METADATA_STORE.to_string(),
                state: "converging".to_string(),
                message,
            }),
        }
    }
}

/// Wait for the metadata store to reach `expected_members` healthy members
pub async fn wait_for_membership(
    driver: VolumeDriverRef,
    observer: &Node,
    expected_members: usize,
    retrier: Retrier,
) -> Result<Vec<MetadataMember>> {
    let members = retrier
        .for_resource(METADATA_STORE)
        .run(MembershipProbe::new(driver, observer.clone(), expected_members))
        .await?;
    info!("Metadata store converged with {} members", members.len());
    Ok(members)
}
