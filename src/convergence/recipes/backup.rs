//! Backup completion
//!
//! `Pending -> InProgress -> Success | Failed | Aborted | PartialSuccess`
//!
//! Only a full success counts; a partial success is reported as a failure.

use crate::convergence::{Attempt, Probe, Retrier};
use crate::domain::ports::{BackupDriverRef, BackupInfo, BackupRequest, BackupStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe for a backup reaching a terminal status
pub struct BackupCompletionProbe {
    driver: BackupDriverRef,
    name: String,
    last_status: Option<BackupStatus>,
}

impl BackupCompletionProbe {
    pub fn new(driver: BackupDriverRef, name: impl Into<String>) -> Self {
        Self {
            driver,
            name: name.into(),
            last_status: None,
        }
    }

    pub fn resource(&self) -> String {
        format!("backup/{}", self.name)
    }

    pub fn last_status(&self) -> Option<BackupStatus> {
        self.last_status
    }
}

#[async_trait]
impl Probe for BackupCompletionProbe {
    type Output = BackupInfo;

    async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<BackupInfo> {
        let info = match self.driver.inspect_backup(&self.name).await {
            Ok(info) => info,
            Err(err) => return Attempt::from_backend_error(err),
        };

        if self.last_status != Some(info.status) {
            info!("Backup {} is {}", self.name, info.status);
            self.last_status = Some(info.status);
        } else {
            debug!("Backup {} still {}", self.name, info.status);
        }

        match info.status {
            BackupStatus::Success => Attempt::Ready(info),
            BackupStatus::Pending | BackupStatus::InProgress => {
                Attempt::retry(Error::NotConverged {
                    resource: self.resource(),
                    state: info.status.to_string(),
                    message: info.reason,
                })
            }
            BackupStatus::Failed | BackupStatus::Aborted | BackupStatus::PartialSuccess => {
                warn!("Backup {} ended {}: {}", self.name, info.status, info.reason);
                Attempt::Fatal(Error::OperationFailed {
                    resource: self.resource(),
                    state: info.status.to_string(),
                    message: info.reason,
                })
            }
        }
    }
}

/// Wait for a backup to succeed
pub async fn wait_for_backup(driver: BackupDriverRef, name: &str, retrier: Retrier) -> Result<BackupInfo> {
    let probe = BackupCompletionProbe::new(driver, name);
    retrier.for_resource(probe.resource()).run(probe).await
}

/// Create a backup and wait for it to succeed
pub async fn create_backup(
    driver: BackupDriverRef,
    request: BackupRequest,
    retrier: Retrier,
) -> Result<BackupInfo> {
    let name = request.name.clone();
    info!(
        "Creating backup {} of {} namespaces in {}",
        name,
        request.namespaces.len(),
        request.cluster
    );
    driver.create_backup(request).await?;
    wait_for_backup(driver, &name, retrier).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sim::{SimBackupDriver, SimCluster};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(name: &str) -> BackupRequest {
        BackupRequest {
            name: name.to_string(),
            cluster: "source".to_string(),
            namespaces: vec!["mysql".to_string()],
            backup_location: "s3-bucket".to_string(),
        }
    }

    fn retrier() -> Retrier {
        Retrier::new(Duration::from_secs(300), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_succeeds() {
        let cluster = SimCluster::with_topology(0);
        let driver: BackupDriverRef = Arc::new(SimBackupDriver::new(cluster));

        let info = create_backup(driver, request("nightly"), retrier())
            .await
            .unwrap();
        assert_eq!(info.status, BackupStatus::Success);
        assert_eq!(info.name, "nightly");
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_is_a_failure() {
        let cluster = SimCluster::with_topology(0);
        cluster
            .script_backup(
                request("nightly"),
                vec![
                    (BackupStatus::InProgress, ""),
                    (BackupStatus::PartialSuccess, "1 volume skipped"),
                ],
            )
            .await;
        let driver: BackupDriverRef = Arc::new(SimBackupDriver::new(cluster));

        let err = create_backup(driver, request("nightly"), retrier())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.resource(), Some("backup/nightly"));
        assert_matches!(
            err.last_observed(),
            Some(Error::OperationFailed { state, message, .. })
                if state == "partial-success" && message == "1 volume skipped"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_is_terminal() {
        let cluster = SimCluster::with_topology(0);
        cluster
            .script_backup(request("b"), vec![(BackupStatus::Aborted, "cancelled")])
            .await;
        let driver: BackupDriverRef = Arc::new(SimBackupDriver::new(cluster));

        let err = wait_for_backup(driver, "b", retrier()).await.unwrap_err();
        assert_eq!(err.attempts(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_backup_times_out_with_read_error() {
        let cluster = SimCluster::with_topology(0);
        let driver: BackupDriverRef = Arc::new(SimBackupDriver::new(cluster));

        let err = wait_for_backup(driver, "missing", retrier()).await.unwrap_err();
        assert!(err.is_timeout());
        assert_matches!(
            err.last_observed(),
            Some(Error::BackendOperationFailed { .. })
        );
    }
}
