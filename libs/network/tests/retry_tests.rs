//! Retry Engine Integration Tests
//!
//! Exercises the public retry API with each backoff policy on a paused
//! clock, so attempt times are exact.

use network::recovery::{
    async_retry, BackoffPolicy, DelaySequence, ExponentialBackoff, FixedDelay,
    FixedWithInitialDelay,
};
use network::TransportError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Run an always-failing operation and return the attempt times in ms
async fn attempt_times(policy: Arc<dyn BackoffPolicy>) -> (Vec<u64>, TransportError) {
    let start = Instant::now();
    let times = Arc::new(Mutex::new(Vec::new()));
    let recorded = times.clone();

    let handle = async_retry(move || {
        let recorded = recorded.clone();
        async move {
            recorded
                .lock()
                .push(start.elapsed().as_millis() as u64);
            Err::<(), _>(TransportError::connection("refused", None))
        }
    })
    .description("always failing")
    .delay_policy(policy)
    .build();

    let error = handle.await.unwrap_err();
    let times = times.lock().clone();
    (times, error)
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_with_retry_limit() {
    let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(300), 2.0)
        .with_max_retries(4);
    let (times, error) = attempt_times(Arc::new(policy)).await;

    assert_eq!(times, vec![0, 100, 300, 600, 900]);
    match error {
        TransportError::RetryExhausted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 5);
            assert!(matches!(*last_error, TransportError::Connection { .. }));
        }
        other => panic!("Expected RetryExhausted, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_sequence_policy_attempt_times() {
    let (times, _) = attempt_times(Arc::new(DelaySequence::from_millis(&[50, 50, 400]))).await;
    assert_eq!(times, vec![0, 50, 100, 500]);
}

#[tokio::test(start_paused = true)]
async fn test_initial_delay_then_fixed() {
    let policy = FixedWithInitialDelay::new(Duration::from_millis(1000), Duration::from_millis(100));
    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();

    let handle = async_retry(move || {
        let counter = counter.clone();
        async move {
            let mut calls = counter.lock();
            *calls += 1;
            if *calls < 4 {
                Err(TransportError::unavailable("leader"))
            } else {
                Ok(*calls)
            }
        }
    })
    .delay_policy(Arc::new(policy))
    .build();

    let start = Instant::now();
    assert_eq!(handle.await.unwrap(), 4);
    assert_eq!(start.elapsed(), Duration::from_millis(1200));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_from_another_task() {
    let handle = async_retry(|| async { Err::<(), _>(TransportError::unavailable("node")) })
        .delay_policy(Arc::new(DelaySequence::from_millis(&[10_000])))
        .build();
    let canceller = handle.canceller();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    assert!(matches!(handle.await, Err(TransportError::Cancelled { .. })));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_stops_unbounded_policy() {
    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();

    let handle = async_retry(move || {
        *counter.lock() += 1;
        async { Err::<(), _>(TransportError::configuration("bad frame size", None)) }
    })
    .delay_policy(Arc::new(FixedDelay::new(Duration::from_millis(100))))
    .retry_if(|e| e.is_retryable())
    .build();

    assert!(matches!(
        handle.await,
        Err(TransportError::Configuration { .. })
    ));
    assert_eq!(*calls.lock(), 1);
}
