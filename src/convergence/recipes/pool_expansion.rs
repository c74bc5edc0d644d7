//! Pool capacity expansion
//!
//! `Queued -> InProgress -> (Rebalancing) -> Successful | Failed`
//!
//! The probe re-reads the pool's last operation on every attempt. A pool that
//! keeps reporting the same rebalance message is stuck and ends the wait.

use crate::convergence::{Attempt, Probe, Retrier};
use crate::domain::ports::VolumeDriverRef;
use crate::error::{Error, Result};
use crate::nodes::{PoolOperation, PoolOperationStatus, ResizeType, StoragePool};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Marker the storage backend puts in the message while rebalancing
pub const REBALANCE_MARKER: &str = "Rebalance in progress";

/// Pool label set when part of the pool is reserved for a journal
pub const JOURNAL_LABEL: &str = "journal";

/// Phase of a pool expansion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpansionState {
    Queued,
    InProgress,
    Rebalancing,
    Successful,
    Failed,
}

impl ExpansionState {
    fn of(operation: &PoolOperation) -> Self {
        match operation.status {
            PoolOperationStatus::Pending => ExpansionState::Queued,
            PoolOperationStatus::InProgress if operation.message.contains(REBALANCE_MARKER) => {
                ExpansionState::Rebalancing
            }
            PoolOperationStatus::InProgress => ExpansionState::InProgress,
            PoolOperationStatus::Successful => ExpansionState::Successful,
            PoolOperationStatus::Failed => ExpansionState::Failed,
        }
    }
}

impl std::fmt::Display for ExpansionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpansionState::Queued => write!(f, "queued"),
            ExpansionState::InProgress => write!(f, "in-progress"),
            ExpansionState::Rebalancing => write!(f, "rebalancing"),
            ExpansionState::Successful => write!(f, "successful"),
            ExpansionState::Failed => write!(f, "failed"),
        }
    }
}

/// Whether the pool reserves space for a journal
pub fn has_journal(pool: &StoragePool) -> bool {
    pool.labels
        .get(JOURNAL_LABEL)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Probe for a pool growing to an expected size
pub struct PoolExpansionProbe {
    driver: VolumeDriverRef,
    pool_uuid: String,
    expected_size_gib: u64,
    journal_reserve_gib: u64,
    state: ExpansionState,
    last_rebalance_message: Option<String>,
}

impl PoolExpansionProbe {
    pub fn new(driver: VolumeDriverRef, pool_uuid: impl Into<String>, expected_size_gib: u64) -> Self {
        Self {
            driver,
            pool_uuid: pool_uuid.into(),
            expected_size_gib,
            journal_reserve_gib: 0,
            state: ExpansionState::Queued,
            last_rebalance_message: None,
        }
    }

    /// Accept a pool this much smaller than expected
    pub fn with_journal_reserve(mut self, reserve_gib: u64) -> Self {
        self.journal_reserve_gib = reserve_gib;
        self
    }

    pub fn state(&self) -> ExpansionState {
        self.state
    }

    pub fn resource(&self) -> String {
        format!("pool/{}", self.pool_uuid)
    }

    /// Smallest size that counts as expanded
    pub fn target_size_gib(&self) -> u64 {
        self.expected_size_gib.saturating_sub(self.journal_reserve_gib)
    }

    fn transition(&mut self, next: ExpansionState) {
        if self.state != next {
            info!("Pool {} expansion {} -> {}", self.pool_uuid, self.state, next);
            self.state = next;
        }
    }

    fn not_converged(&self, message: impl Into<String>) -> Error {
        Error::NotConverged {
            resource: self.resource(),
            state: self.state.to_string(),
            message: message.into(),
        }
    }

    fn observe(&mut self, pool: StoragePool) -> Attempt<StoragePool> {
        let Some(operation) = pool.last_operation.clone() else {
            self.transition(ExpansionState::Queued);
            return Attempt::retry(self.not_converged("no resize operation reported yet"));
        };

        let next = ExpansionState::of(&operation);
        debug!(
            "Pool {} status {} ({}), size {} GiB",
            self.pool_uuid,
            operation.status,
            operation.message,
            pool.total_size_gib()
        );

        if next != ExpansionState::Rebalancing {
            self.last_rebalance_message = None;
        }
        self.transition(next);

        match next {
            ExpansionState::Failed => {
                warn!("Pool {} expansion failed: {}", self.pool_uuid, operation.message);
                Attempt::Fatal(Error::OperationFailed {
                    resource: self.resource(),
                    state: next.to_string(),
                    message: operation.message,
                })
            }
            ExpansionState::Successful => {
                let size = pool.total_size_gib();
                if size >= self.target_size_gib() {
                    Attempt::Ready(pool)
                } else {
                    Attempt::retry(self.not_converged(format!(
                        "pool size {} GiB, expected at least {} GiB",
                        size,
                        self.target_size_gib()
                    )))
                }
            }
            ExpansionState::Rebalancing => {
                if self.last_rebalance_message.as_deref() == Some(operation.message.as_str()) {
                    warn!(
                        "Pool {} rebalance is not progressing: {}",
                        self.pool_uuid, operation.message
                    );
                    return Attempt::Fatal(Error::Stalled {
                        resource: self.resource(),
                        message: operation.message,
                    });
                }
                self.last_rebalance_message = Some(operation.message.clone());
                Attempt::retry(self.not_converged(operation.message))
            }
            ExpansionState::Queued | ExpansionState::InProgress => {
                Attempt::retry(self.not_converged(operation.message))
            }
        }
    }
}

#[async_trait]
impl Probe for PoolExpansionProbe {
    type Output = StoragePool;

    async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<StoragePool> {
        match self.driver.get_storage_pool(&self.pool_uuid).await {
            Ok(Some(pool)) => self.observe(pool),
            Ok(None) => Attempt::Fatal(Error::OperationFailed {
                resource: self.resource(),
                state: self.state.to_string(),
                message: "pool is not known to the storage backend".to_string(),
            }),
            Err(err) => Attempt::from_backend_error(err),
        }
    }
}

/// Wait until a pool reports a successful resize to at least the expected size
pub async fn wait_for_pool_expansion(
    driver: VolumeDriverRef,
    pool_uuid: &str,
    expected_size_gib: u64,
    journal_reserve_gib: u64,
    retrier: Retrier,
) -> Result<StoragePool> {
    let probe = PoolExpansionProbe::new(driver, pool_uuid, expected_size_gib)
        .with_journal_reserve(journal_reserve_gib);
    retrier.for_resource(probe.resource()).run(probe).await
}

/// Ask the backend to grow a pool, then wait for the resize to land
pub async fn expand_pool(
    driver: VolumeDriverRef,
    pool_uuid: &str,
    resize: ResizeType,
    new_size_gib: u64,
    journal_reserve_gib: u64,
    retrier: Retrier,
) -> Result<StoragePool> {
    info!("Expanding pool {} to {} GiB ({:?})", pool_uuid, new_size_gib, resize);
    driver.expand_pool(pool_uuid, resize, new_size_gib).await?;
    wait_for_pool_expansion(driver, pool_uuid, new_size_gib, journal_reserve_gib, retrier).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sim::{PoolObservation, SimCluster, SimVolumeDriver};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn obs(status: PoolOperationStatus, message: &str, size_gib: u64) -> PoolObservation {
        PoolObservation::new(status, message, size_gib)
    }

    async fn setup(script: Vec<PoolObservation>) -> (Arc<SimCluster>, VolumeDriverRef) {
        let cluster = SimCluster::with_topology(1);
        cluster.script_pool("pool-0", script).await;
        let driver: VolumeDriverRef = Arc::new(SimVolumeDriver::new(cluster.clone()));
        (cluster, driver)
    }

    fn retrier() -> Retrier {
        Retrier::new(Duration::from_secs(60), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_expansion() {
        let (cluster, driver) = setup(vec![
            obs(PoolOperationStatus::InProgress, "resizing", 0),
            obs(PoolOperationStatus::Successful, "done", 200),
        ])
        .await;

        let pool = wait_for_pool_expansion(driver, "pool-0", 200, 0, retrier())
            .await
            .unwrap();
        assert_eq!(pool.total_size_gib(), 200);
        assert_eq!(cluster.pool_reads("pool-0").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_is_terminal() {
        let (cluster, driver) = setup(vec![
            obs(PoolOperationStatus::InProgress, "resizing", 0),
            obs(PoolOperationStatus::Failed, "no free drives", 0),
        ])
        .await;

        let err = wait_for_pool_expansion(driver, "pool-0", 200, 0, retrier())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.resource(), Some("pool/pool-0"));
        assert_matches!(
            err.last_observed(),
            Some(Error::OperationFailed { message, .. }) if message == "no free drives"
        );
        assert_eq!(cluster.pool_reads("pool-0").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_rebalance_message_stalls() {
        let (_cluster, driver) = setup(vec![
            obs(PoolOperationStatus::InProgress, "Rebalance in progress: 10%", 0),
            obs(PoolOperationStatus::InProgress, "Rebalance in progress: 40%", 0),
            obs(PoolOperationStatus::InProgress, "Rebalance in progress: 40%", 0),
        ])
        .await;

        let err = wait_for_pool_expansion(driver, "pool-0", 200, 0, retrier())
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert_matches!(err.last_observed(), Some(Error::Stalled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_between_rebalances_resets_stall_detection() {
        let (_cluster, driver) = setup(vec![
            obs(PoolOperationStatus::InProgress, "Rebalance in progress", 0),
            obs(PoolOperationStatus::InProgress, "adding drive", 0),
            obs(PoolOperationStatus::InProgress, "Rebalance in progress", 0),
            obs(PoolOperationStatus::Successful, "done", 200),
        ])
        .await;

        let pool = wait_for_pool_expansion(driver, "pool-0", 200, 0, retrier()).await;
        assert!(pool.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_reserve_lowers_target() {
        let script = vec![obs(PoolOperationStatus::Successful, "done", 197)];

        let (_cluster, driver) = setup(script.clone()).await;
        let with_journal = wait_for_pool_expansion(driver, "pool-0", 200, 3, retrier()).await;
        assert_eq!(with_journal.unwrap().total_size_gib(), 197);

        let (_cluster, driver) = setup(script).await;
        let short = Retrier::new(Duration::from_secs(3), Duration::from_secs(1));
        let err = wait_for_pool_expansion(driver, "pool-0", 200, 0, short)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_matches!(err.last_observed(), Some(Error::NotConverged { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_pool_is_terminal() {
        let (_cluster, driver) = setup(vec![]).await;
        let err = wait_for_pool_expansion(driver, "pool-9", 200, 0, retrier())
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(1));
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expand_pool_uses_backend_progress() {
        let cluster = SimCluster::with_topology(1);
        let driver: VolumeDriverRef = Arc::new(SimVolumeDriver::new(cluster.clone()));

        let pool = expand_pool(driver, "pool-0", ResizeType::ResizeDisk, 150, 0, retrier())
            .await
            .unwrap();
        assert_eq!(pool.total_size_gib(), 150);
        assert_eq!(cluster.pool_reads("pool-0").await, 3);
    }

    #[test]
    fn test_state_classification() {
        let op = |status, message: &str| PoolOperation {
            status,
            message: message.to_string(),
        };
        assert_eq!(
            ExpansionState::of(&op(PoolOperationStatus::InProgress, "Rebalance in progress")),
            ExpansionState::Rebalancing
        );
        assert_eq!(
            ExpansionState::of(&op(PoolOperationStatus::InProgress, "resizing")),
            ExpansionState::InProgress
        );
        assert_eq!(
            ExpansionState::of(&op(PoolOperationStatus::Pending, "")),
            ExpansionState::Queued
        );
    }

    #[test]
    fn test_has_journal() {
        let mut pool = StoragePool::new("p", 10);
        assert!(!has_journal(&pool));
        pool.labels.insert(JOURNAL_LABEL.into(), "true".into());
        assert!(has_journal(&pool));
    }
}
