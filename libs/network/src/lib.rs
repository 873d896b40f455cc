//! Stream Client Network Layer
//!
//! Transport boundary for the stream client: connection traits, protocol
//! value types, the retry engine used for recovery, and metrics collectors.
//! An in-memory transport is available under the `testing` feature.

pub mod error;
pub mod metrics;
pub mod protocol;
pub mod recovery;
pub mod transports;

// Re-export commonly used types
pub use error::{Result, TransportError};
pub use metrics::{CountingMetricsCollector, MetricsCollector, MetricsSnapshot, NoopMetricsCollector};
pub use protocol::{
    Address, Chunk, OffsetSpecification, ResponseCode, ShutdownReason, StreamMetadata,
    DEFAULT_PORT,
};
pub use recovery::{async_retry, BackoffPolicy, RetryCanceller, RetryHandle};
pub use transports::{Connection, ConnectionListener, ConnectionParameters, Transport};

#[cfg(feature = "monitoring")]
pub use metrics::PrometheusMetricsCollector;
