//! Convergence Recipes
//!
//! Each recipe encodes one long-running infrastructure transition as an
//! explicit state enum plus a [`Probe`](crate::convergence::Probe) that
//! classifies every observation as ready, transient or terminal.

pub mod backup;
pub mod decommission;
pub mod membership;
pub mod pool_expansion;
pub mod rejoin;
pub mod upgrade;

pub use backup::*;
pub use decommission::*;
pub use membership::*;
pub use pool_expansion::*;
pub use rejoin::*;
pub use upgrade::*;

use crate::error::{Error, Result};
use futures::future::join_all;
use std::future::Future;

/// Run independent convergence waits concurrently and wait for all of them.
///
/// Every wait runs on its own task. Results come back in input order; a task
/// that panics is reported as [`Error::Internal`] in its slot.
pub async fn converge_all<I, F, T>(operations: I) -> Vec<Result<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = operations.into_iter().map(tokio::spawn).collect();

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|e| Err(Error::Internal(format!("convergence task failed: {}", e))))
        })
        .collect()
}
