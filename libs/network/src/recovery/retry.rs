//! Async Retry Engine
//!
//! Runs an async operation on a scheduler until it succeeds, the backoff
//! policy gives up, a predicate rejects the error, or the caller cancels.
//! The caller gets a [`RetryHandle`] right away and awaits it for the
//! outcome.
//!
//! ```ignore
//! let handle = async_retry(move || open_connection(address.clone()))
//!     .description("open connection")
//!     .delay_policy(Arc::new(DelaySequence::from_millis(&[100, 200, 300])))
//!     .build();
//! let connection = handle.await?;
//! ```

use crate::recovery::backoff::{BackoffPolicy, FixedDelay};
use crate::{Result, TransportError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Default wait between attempts when no policy is given
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Decides whether a failed attempt may be retried
pub type RetryPredicate = Arc<dyn Fn(&TransportError) -> bool + Send + Sync>;

/// Retry builder; see [`async_retry`]
pub struct AsyncRetry<F> {
    operation: F,
    description: String,
    policy: Arc<dyn BackoffPolicy>,
    scheduler: Option<Handle>,
    retry_if: Option<RetryPredicate>,
}

/// Start building a retried operation
pub fn async_retry<F>(operation: F) -> AsyncRetry<F> {
    AsyncRetry {
        operation,
        description: "operation".to_string(),
        policy: Arc::new(FixedDelay::new(DEFAULT_RETRY_DELAY)),
        scheduler: None,
        retry_if: None,
    }
}

impl<F> AsyncRetry<F> {
    /// Label used in logs and errors
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn delay_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Runtime the attempts run on; defaults to the current one
    pub fn scheduler(mut self, scheduler: Handle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Errors for which the predicate returns false fail immediately
    pub fn retry_if(
        mut self,
        predicate: impl Fn(&TransportError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Schedule the first attempt and return a handle to the outcome
    pub fn build<T, Fut>(self) -> RetryHandle<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let control = Arc::new(RetryControl::default());
        let (sender, receiver) = oneshot::channel();
        let handle = RetryHandle {
            receiver,
            canceller: RetryCanceller {
                control: control.clone(),
            },
            description: self.description.clone(),
        };

        let scheduler = match self.scheduler.map(Ok).unwrap_or_else(Handle::try_current) {
            Ok(scheduler) => scheduler,
            Err(_) => {
                let _ = sender.send(Err(TransportError::configuration(
                    format!("no runtime available to retry {}", self.description),
                    Some("scheduler"),
                )));
                return handle;
            }
        };

        let AsyncRetry {
            operation,
            description,
            policy,
            retry_if,
            ..
        } = self;
        scheduler.spawn(async move {
            let outcome = run(operation, policy, retry_if, &description, &control).await;
            let _ = sender.send(outcome);
        });

        handle
    }
}

#[derive(Default)]
struct RetryControl {
    cancelled: AtomicBool,
    wake: Notify,
}

impl RetryControl {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

async fn run<T, F, Fut>(
    mut operation: F,
    policy: Arc<dyn BackoffPolicy>,
    retry_if: Option<RetryPredicate>,
    description: &str,
    control: &RetryControl,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry_index: u32 = 0;
    loop {
        if control.is_cancelled() {
            debug!(description, "Retry cancelled before attempt");
            return Err(TransportError::cancelled(description));
        }

        let attempt = retry_index + 1;
        debug!(description, attempt, "Running attempt");
        let result = operation().await;

        // The attempt ran to completion; its result no longer matters
        if control.is_cancelled() {
            debug!(description, attempt, "Discarding attempt result after cancel");
            return Err(TransportError::cancelled(description));
        }

        let error = match result {
            Ok(value) => {
                if retry_index > 0 {
                    debug!(description, attempt, "Succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if let Some(predicate) = &retry_if {
            if !predicate(&error) {
                debug!(description, attempt, error = %error, "Error not retryable");
                return Err(error);
            }
        }

        match policy.delay(retry_index) {
            Some(delay) => {
                debug!(
                    description,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = control.wake.notified() => {}
                }
                retry_index = retry_index.saturating_add(1);
            }
            None => {
                warn!(description, attempts = attempt, error = %error, "Giving up");
                return Err(TransportError::retry_exhausted(description, attempt, error));
            }
        }
    }
}

/// Cancels a scheduled retry from anywhere
#[derive(Clone)]
pub struct RetryCanceller {
    control: Arc<RetryControl>,
}

impl RetryCanceller {
    /// No further attempts are scheduled; a running attempt finishes but its
    /// result is discarded
    pub fn cancel(&self) {
        self.control.cancelled.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

/// Outcome of a retried operation
pub struct RetryHandle<T> {
    receiver: oneshot::Receiver<Result<T>>,
    canceller: RetryCanceller,
    description: String,
}

impl<T> RetryHandle<T> {
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> RetryCanceller {
        self.canceller.clone()
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<T> Future for RetryHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Runtime shut down under the retry task
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::cancelled(
                this.description.clone(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::backoff::DelaySequence;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    fn assert_near(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_policy_exhausts_after_four_attempts() {
        let start = Instant::now();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let recorded = attempts.clone();

        let handle = async_retry(move || {
            recorded.lock().push(start.elapsed());
            async { Err::<(), _>(TransportError::connection("refused", None)) }
        })
        .description("open connection")
        .delay_policy(Arc::new(DelaySequence::from_millis(&[100, 200, 300])))
        .build();

        let err = handle.await.unwrap_err();
        match err {
            TransportError::RetryExhausted {
                attempts: count,
                last_error,
                ..
            } => {
                assert_eq!(count, 4);
                assert!(matches!(*last_error, TransportError::Connection { .. }));
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }

        let times = attempts.lock().clone();
        assert_eq!(times.len(), 4);
        for (actual, expected) in times.iter().zip([0u64, 100, 300, 600]) {
            assert_near(*actual, expected);
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();

        let handle = async_retry(move || {
            let mut calls = counter.lock();
            *calls += 1;
            let current = *calls;
            async move {
                if current < 3 {
                    Err(TransportError::unavailable("leader"))
                } else {
                    Ok(current)
                }
            }
        })
        .delay_policy(Arc::new(FixedDelay::new(Duration::from_millis(50))))
        .build();

        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_further_attempts() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();

        let handle = async_retry(move || {
            *counter.lock() += 1;
            async { Err::<(), _>(TransportError::connection("refused", None)) }
        })
        .description("recover consumer")
        .delay_policy(Arc::new(FixedDelay::new(Duration::from_millis(100))))
        .build();
        let canceller = handle.canceller();

        tokio::time::sleep(Duration::from_millis(250)).await;
        canceller.cancel();

        assert!(matches!(
            handle.await,
            Err(TransportError::Cancelled { .. })
        ));
        assert_eq!(*calls.lock(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_running_attempt() {
        let start = Instant::now();
        let handle = async_retry(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, TransportError>(42)
        })
        .build();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        assert!(matches!(
            handle.await,
            Err(TransportError::Cancelled { .. })
        ));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_rejects_error() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();

        let handle = async_retry(move || {
            *counter.lock() += 1;
            async { Err::<(), _>(TransportError::closed("producer")) }
        })
        .retry_if(|error| !error.is_terminal())
        .build();

        assert!(matches!(handle.await, Err(TransportError::Closed { .. })));
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_build_outside_runtime_fails_cleanly() {
        let handle = async_retry(|| async { Ok::<_, TransportError>(1) }).build();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        assert!(matches!(
            runtime.block_on(handle),
            Err(TransportError::Configuration { .. })
        ));
    }
}
