//! Recovery Building Blocks
//!
//! Backoff policies and the async retry engine used to reconnect the
//! locator and to re-home producers and consumers after a connection loss.

pub mod backoff;
pub mod retry;

pub use backoff::{
    BackoffPolicy, DelaySequence, ExponentialBackoff, FixedDelay, FixedWithInitialDelay,
};
pub use retry::{async_retry, AsyncRetry, RetryCanceller, RetryHandle, RetryPredicate};
