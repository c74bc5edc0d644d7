//! Retry Engine
//!
//! Turns a single-shot probe into a bounded polling loop with uniform
//! timeout semantics. The engine owns timing only; deciding whether an
//! observation is transient or terminal is entirely up to the probe.
//!
//! Within one invocation probes run strictly one after another. The first
//! probe always runs to completion; later probes are raced against the
//! deadline and dropped (with their cancellation token fired) when it
//! expires.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

// =============================================================================
// Probe Contract
// =============================================================================

/// Outcome of a single probe invocation
#[derive(Debug)]
pub enum Attempt<T> {
    /// Converged; stop polling and return the value
    Ready(T),
    /// Not there yet; poll again after the interval. The error, if any,
    /// becomes the last observed state.
    Retry(Option<Error>),
    /// Will never converge; stop polling immediately
    Fatal(Error),
}

impl<T> Attempt<T> {
    /// Transient observation with a descriptive error
    pub fn retry(err: Error) -> Self {
        Attempt::Retry(Some(err))
    }

    /// Transient observation with nothing new to report
    pub fn pending() -> Self {
        Attempt::Retry(None)
    }

    /// Map a failed backend read inside a probe. The read is polled again;
    /// only an explicit failure status reported by the backend ends the wait.
    pub fn from_backend_error(err: Error) -> Self {
        Attempt::Retry(Some(err))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Attempt::Ready(_))
    }
}

/// One observation of an in-flight operation
#[async_trait]
pub trait Probe: Send {
    type Output: Send;

    /// Observe the operation once. `cancel` fires when the engine gives up on
    /// this invocation; long backend calls should watch it.
    async fn probe(&mut self, cancel: &CancellationToken) -> Attempt<Self::Output>;
}

/// Probe backed by a closure
pub struct FnProbe<F> {
    f: F,
}

/// Wrap a closure as a [`Probe`]
pub fn probe_fn<F, Fut, T>(f: F) -> FnProbe<F>
where
    F: FnMut(CancellationToken) -> Fut + Send,
    Fut: Future<Output = Attempt<T>> + Send + 'static,
    T: Send + 'static,
{
    FnProbe { f }
}

#[async_trait]
impl<F, Fut, T> Probe for FnProbe<F>
where
    F: FnMut(CancellationToken) -> Fut + Send,
    Fut: Future<Output = Attempt<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn probe(&mut self, cancel: &CancellationToken) -> Attempt<T> {
        (self.f)(cancel.clone()).await
    }
}

// =============================================================================
// Retrier
// =============================================================================

/// Polling policy for one convergence wait
#[derive(Debug, Clone)]
pub struct Retrier {
    resource: String,
    timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
}

impl Retrier {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            resource: "operation".to_string(),
            timeout,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Name the resource being waited on; it appears in every error
    pub fn for_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Abort the wait when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `probe` until it is ready, fails, or the timeout elapses.
    ///
    /// - `Ready(v)` returns `Ok(v)` at once.
    /// - `Fatal(e)` returns [`Error::ConvergenceFailed`] at once, whatever
    ///   budget remains.
    /// - `Retry(_)` sleeps `interval` and polls again, unless the time since
    ///   the first invocation has reached `timeout`, in which case
    ///   [`Error::ConvergenceTimeout`] carries the last observed error.
    ///
    /// A zero timeout performs exactly one invocation. An interval at least
    /// as long as the timeout degrades to a single invocation.
    pub async fn run<P: Probe>(&self, mut probe: P) -> Result<P::Output> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let attempt_token = self.cancel.child_token();
        let mut attempts: u32 = 0;
        let mut last_error: Option<Error> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(attempts, last_error));
            }

            attempts += 1;
            trace!(resource = %self.resource, attempt = attempts, "Probing");

            let outcome = if attempts == 1 {
                probe.probe(&attempt_token).await
            } else {
                tokio::select! {
                    biased;
                    outcome = probe.probe(&attempt_token) => outcome,
                    _ = tokio::time::sleep_until(deadline) => {
                        attempt_token.cancel();
                        return Err(self.timed_out(start, attempts, last_error));
                    }
                    _ = self.cancel.cancelled() => {
                        return Err(self.cancelled(attempts, last_error));
                    }
                }
            };

            match outcome {
                Attempt::Ready(value) => {
                    debug!(resource = %self.resource, attempts, "Converged");
                    return Ok(value);
                }
                Attempt::Fatal(err) => {
                    debug!(resource = %self.resource, attempts, error = %err, "Terminal failure");
                    return Err(Error::ConvergenceFailed {
                        resource: self.resource.clone(),
                        attempts,
                        source: Box::new(err),
                    });
                }
                Attempt::Retry(err) => {
                    if let Some(err) = err {
                        trace!(resource = %self.resource, attempt = attempts, error = %err, "Not converged");
                        last_error = Some(err);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(start, attempts, last_error));
            }

            let wake = std::cmp::min(now + self.interval, deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = self.cancel.cancelled() => {
                    return Err(self.cancelled(attempts, last_error));
                }
            }

            if Instant::now() >= deadline {
                return Err(self.timed_out(start, attempts, last_error));
            }
        }
    }

    fn timed_out(&self, start: Instant, attempts: u32, last_error: Option<Error>) -> Error {
        Error::ConvergenceTimeout {
            resource: self.resource.clone(),
            elapsed: start.elapsed(),
            attempts,
            last_error: last_error.map(Box::new),
        }
    }

    fn cancelled(&self, attempts: u32, last_error: Option<Error>) -> Error {
        Error::ConvergenceCancelled {
            resource: self.resource.clone(),
            attempts,
            last_error: last_error.map(Box::new),
        }
    }
}

/// Poll a closure until it converges, fails or `timeout` elapses.
///
/// See [`Retrier::run`] for the exact semantics.
pub async fn do_retry_with_timeout<F, Fut, T>(
    mut f: F,
    timeout: Duration,
    interval: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Attempt<T>> + Send + 'static,
    T: Send + 'static,
{
    Retrier::new(timeout, interval)
        .run(probe_fn(move |_cancel| f()))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn not_converged(n: u32) -> Error {
        Error::NotConverged {
            resource: "thing".into(),
            state: "waiting".into(),
            message: format!("attempt {}", n),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_retry_times_out_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let result: Result<()> = do_retry_with_timeout(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Attempt::retry(not_converged(n)) }
            },
            Duration::from_millis(500),
            Duration::from_millis(100),
        )
        .await;

        let err = result.unwrap_err();
        let calls = calls.load(Ordering::SeqCst);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(calls >= 4, "only {} probe invocations", calls);
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), Some(calls));
        assert_matches!(
            err.last_observed(),
            Some(Error::NotConverged { message, .. }) if *message == format!("attempt {}", calls)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let result: Result<()> = do_retry_with_timeout(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Fatal(Error::Internal("boom".into())) }
            },
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_fatal());
        assert_matches!(err.last_observed(), Some(Error::Internal(msg)) if msg == "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = do_retry_with_timeout(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 3 {
                        Attempt::Ready(42)
                    } else {
                        Attempt::pending()
                    }
                }
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_probes_once_without_sleeping() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let result: Result<()> = do_retry_with_timeout(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Attempt::retry(not_converged(1)) }
            },
            Duration::ZERO,
            Duration::from_secs(1),
        )
        .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_still_returns_ready_value() {
        let value = do_retry_with_timeout(
            || async { Attempt::Ready("up") },
            Duration::ZERO,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(value, "up");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_longer_than_timeout_is_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = do_retry_with_timeout(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Attempt::pending() }
            },
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.last_observed().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_without_error_keeps_previous_observation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = do_retry_with_timeout(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Attempt::retry(not_converged(1))
                    } else {
                        Attempt::pending()
                    }
                }
            },
            Duration::from_secs(3),
            Duration::from_secs(1),
        )
        .await;

        assert_matches!(
            result.unwrap_err().last_observed(),
            Some(Error::NotConverged { message, .. }) if message == "attempt 1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_is_cut_off_at_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let result: Result<()> = Retrier::new(Duration::from_secs(5), Duration::from_secs(1))
            .for_resource("pool/hung")
            .run(probe_fn(move |token: CancellationToken| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        return Attempt::retry(not_converged(1));
                    }
                    // backend call that only returns once cancelled
                    token.cancelled().await;
                    Attempt::pending()
                }
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.resource(), Some("pool/hung"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation() {
        let token = CancellationToken::new();
        let retrier = Retrier::new(Duration::from_secs(60), Duration::from_secs(1))
            .for_resource("node/w1")
            .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            token.cancel();
        });

        let result: Result<()> = retrier
            .run(probe_fn(|_| async { Attempt::retry(not_converged(0)) }))
            .await;
        canceller.await.unwrap();

        let err = result.unwrap_err();
        assert_matches!(err, Error::ConvergenceCancelled { attempts: 3, .. });
        assert!(err.last_observed().is_some());
    }

    struct Countdown {
        remaining: u32,
    }

    #[async_trait]
    impl Probe for Countdown {
        type Output = &'static str;

        async fn probe(&mut self, _cancel: &CancellationToken) -> Attempt<&'static str> {
            if self.remaining == 0 {
                Attempt::Ready("done")
            } else {
                self.remaining -= 1;
                Attempt::pending()
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stateful_probe() {
        let start = Instant::now();
        let result = Retrier::new(Duration::from_secs(10), Duration::from_secs(1))
            .run(Countdown { remaining: 2 })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_backend_error_mapping() {
        let unavailable: Attempt<()> = Attempt::from_backend_error(Error::BackendUnavailable {
            backend: "sim".into(),
        });
        assert_matches!(unavailable, Attempt::Retry(Some(_)));

        let failed_read: Attempt<()> = Attempt::from_backend_error(Error::BackendOperationFailed {
            backend: "sim".into(),
            operation: "get_node_status".into(),
            reason: "connection reset".into(),
        });
        assert_matches!(failed_read, Attempt::Retry(Some(Error::BackendOperationFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_is_polled_again() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let start = Instant::now();
        let value = do_retry_with_timeout(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Attempt::from_backend_error(Error::BackendOperationFailed {
                            backend: "sim".into(),
                            operation: "get_node_status".into(),
                            reason: "connection reset".into(),
                        })
                    } else {
                        Attempt::Ready(n)
                    }
                }
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
