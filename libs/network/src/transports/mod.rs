//! Transport Boundary
//!
//! A [`Transport`] opens [`Connection`]s to broker nodes. Each connection
//! reports asynchronous events (chunks, publish confirms, shutdown) to the
//! [`ConnectionListener`] supplied when it was opened. Listener callbacks run
//! on the transport's I/O path and must not block.

use crate::protocol::{
    Address, Chunk, OffsetSpecification, ResponseCode, ShutdownReason, StreamMetadata,
};
use crate::Result;
use async_trait::async_trait;
use codec::EncodedMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

#[cfg(any(test, feature = "testing"))]
pub use mock::{MockCall, MockConnection, MockTransport};

/// Events pushed by a connection
pub trait ConnectionListener: Send + Sync {
    /// Chunk delivered for a subscription on this connection
    fn on_chunk(&self, _subscription_id: u8, _chunk: Chunk) {}

    /// Publishing ids confirmed for a publisher on this connection
    fn on_publish_confirm(&self, _publisher_id: u8, _publishing_ids: &[u64]) {}

    /// Publishing ids rejected for a publisher on this connection
    fn on_publish_error(&self, _publisher_id: u8, _errors: &[(u64, ResponseCode)]) {}

    /// Topology of `stream` changed; every publisher and subscription for
    /// it on this connection has been dropped by the broker
    fn on_metadata_update(&self, _stream: &str, _code: ResponseCode) {}

    /// Connection is gone. Fired at most once per connection.
    fn on_shutdown(&self, reason: ShutdownReason);
}

/// Everything needed to open one connection
#[derive(Clone)]
pub struct ConnectionParameters {
    pub address: Address,
    /// Name reported to the broker, e.g. `rabbitmq-stream-producer-0`
    pub client_name: String,
    pub listener: Arc<dyn ConnectionListener>,
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("address", &self.address)
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}

/// Factory for broker connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, parameters: ConnectionParameters) -> Result<Arc<dyn Connection>>;
}

/// Open connection to one broker node
#[async_trait]
pub trait Connection: Send + Sync {
    fn address(&self) -> &Address;

    fn client_name(&self) -> &str;

    /// False once closed or broken
    fn is_open(&self) -> bool;

    async fn subscribe(
        &self,
        subscription_id: u8,
        stream: &str,
        offset: OffsetSpecification,
    ) -> Result<ResponseCode>;

    async fn unsubscribe(&self, subscription_id: u8) -> Result<ResponseCode>;

    /// Send already-encoded messages; returns the publishing id of each
    async fn publish(&self, publisher_id: u8, messages: Vec<EncodedMessage>) -> Result<Vec<u64>>;

    /// Last offset stored under `reference` for `stream`, if any
    async fn query_offset(&self, reference: &str, stream: &str) -> Result<Option<u64>>;

    async fn store_offset(&self, reference: &str, stream: &str, offset: u64) -> Result<()>;

    async fn metadata(&self, streams: &[String]) -> Result<HashMap<String, StreamMetadata>>;

    async fn create_stream(&self, stream: &str) -> Result<ResponseCode>;

    async fn delete_stream(&self, stream: &str) -> Result<ResponseCode>;

    /// Client-initiated close; the listener sees [`ShutdownReason::ClientClose`]
    async fn close(&self) -> Result<()>;
}
