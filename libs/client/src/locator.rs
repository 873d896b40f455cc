//! Locator
//!
//! Dedicated connection used to resolve stream topology and to run
//! administrative requests (create/delete stream, offset queries). When it
//! drops unexpectedly the locator turns `Unavailable` and reconnects in the
//! background through the retry engine, picking a random configured address
//! on each attempt.

use network::recovery::{async_retry, BackoffPolicy};
use network::{
    Address, Connection, ConnectionListener, ConnectionParameters, Result, ShutdownReason,
    StreamMetadata, Transport, TransportError,
};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

enum LocatorState {
    Connected {
        connection: Arc<dyn Connection>,
        generation: u64,
    },
    Unavailable,
    Closed,
}

struct LocatorInner {
    transport: Arc<dyn Transport>,
    addresses: Vec<Address>,
    client_name: String,
    recovery_policy: Arc<dyn BackoffPolicy>,
    scheduler: Handle,
    state: RwLock<LocatorState>,
    recovery: Mutex<Option<network::RetryCanceller>>,
    generation: AtomicU64,
}

/// Topology and administration connection
#[derive(Clone)]
pub struct Locator {
    inner: Arc<LocatorInner>,
}

struct LocatorListener {
    locator: Weak<LocatorInner>,
    generation: u64,
}

impl ConnectionListener for LocatorListener {
    fn on_shutdown(&self, reason: ShutdownReason) {
        if !reason.is_unexpected() {
            return;
        }
        if let Some(locator) = self.locator.upgrade() {
            locator.connection_lost(self.generation, reason);
        }
    }
}

impl Locator {
    /// Open the locator, trying `addresses` in order; the last error wins
    pub async fn connect(
        transport: Arc<dyn Transport>,
        addresses: Vec<Address>,
        client_name: &str,
        recovery_policy: Arc<dyn BackoffPolicy>,
        scheduler: Handle,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(TransportError::configuration(
                "no broker address configured",
                Some("addresses"),
            ));
        }

        let inner = Arc::new(LocatorInner {
            transport,
            addresses,
            client_name: format!("{}-locator-connection", client_name),
            recovery_policy,
            scheduler,
            state: RwLock::new(LocatorState::Unavailable),
            recovery: Mutex::new(None),
            generation: AtomicU64::new(0),
        });

        let mut last_error = None;
        for address in inner.addresses.clone() {
            match inner.open(&address).await {
                Ok(()) => return Ok(Self { inner }),
                Err(e) => {
                    warn!(address = %address, error = %e, "Locator connection failed, trying next address");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::connection("no broker address reachable", None)
        }))
    }

    pub fn is_available(&self) -> bool {
        matches!(*self.inner.state.read(), LocatorState::Connected { .. })
    }

    /// Current locator connection, or `Unavailable` while reconnecting
    pub fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.inner.connection()
    }

    /// Topology of one stream
    pub async fn metadata(&self, stream: &str) -> Result<StreamMetadata> {
        let connection = self.connection()?;
        let mut metadata = connection.metadata(&[stream.to_string()]).await?;
        Ok(metadata
            .remove(stream)
            .unwrap_or_else(|| StreamMetadata::missing(stream)))
    }

    /// Node currently leading `stream`
    pub async fn leader_for(&self, stream: &str) -> Result<Address> {
        let metadata = self.metadata(stream).await?;
        if !metadata.code.is_ok() {
            return Err(TransportError::stream_unavailable(
                stream,
                format!("metadata returned {}", metadata.code),
            ));
        }
        metadata
            .leader
            .ok_or_else(|| TransportError::stream_unavailable(stream, "no leader"))
    }

    pub async fn create_stream(&self, stream: &str) -> Result<()> {
        let code = self.connection()?.create_stream(stream).await?;
        code.ok_or_error(&format!("create stream '{}'", stream))
    }

    pub async fn delete_stream(&self, stream: &str) -> Result<()> {
        let code = self.connection()?.delete_stream(stream).await?;
        code.ok_or_error(&format!("delete stream '{}'", stream))
    }

    /// Stored offset of `reference` on `stream`
    pub async fn query_offset(&self, reference: &str, stream: &str) -> Result<Option<u64>> {
        self.connection()?.query_offset(reference, stream).await
    }

    /// Stop recovery and close the connection. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), LocatorState::Closed);
        if let Some(recovery) = self.inner.recovery.lock().take() {
            recovery.cancel();
        }

        if let LocatorState::Connected { connection, .. } = previous {
            debug!("Closing locator connection");
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close locator connection");
            }
        }
    }
}

impl LocatorInner {
    fn connection(&self) -> Result<Arc<dyn Connection>> {
        match &*self.state.read() {
            LocatorState::Connected { connection, .. } => Ok(connection.clone()),
            LocatorState::Unavailable => Err(TransportError::unavailable("locator connection")),
            LocatorState::Closed => Err(TransportError::closed("locator")),
        }
    }

    async fn open(self: &Arc<Self>, address: &Address) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let connection = self
            .transport
            .open(ConnectionParameters {
                address: address.clone(),
                client_name: self.client_name.clone(),
                listener: Arc::new(LocatorListener {
                    locator: Arc::downgrade(self),
                    generation,
                }),
            })
            .await?;

        let installed = {
            let mut state = self.state.write();
            if matches!(*state, LocatorState::Closed) {
                false
            } else {
                *state = LocatorState::Connected {
                    connection: connection.clone(),
                    generation,
                };
                true
            }
        };

        if !installed {
            let _ = connection.close().await;
            return Err(TransportError::closed("locator"));
        }
        info!(address = %address, generation, "Locator connected");
        Ok(())
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, reason: ShutdownReason) {
        {
            let mut state = self.state.write();
            let current = matches!(
                &*state,
                LocatorState::Connected { generation: current, .. } if *current == generation
            );
            if !current {
                return;
            }
            *state = LocatorState::Unavailable;
        }
        warn!(generation, reason = ?reason, "Locator connection lost, reconnecting");

        let locator = Arc::downgrade(self);
        let handle = async_retry(move || {
            let locator = locator.clone();
            async move {
                let locator = locator
                    .upgrade()
                    .ok_or_else(|| TransportError::closed("locator"))?;
                let address = locator
                    .addresses
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .ok_or_else(|| {
                        TransportError::configuration("no broker address configured", Some("addresses"))
                    })?;
                locator.open(&address).await
            }
        })
        .description("locator recovery")
        .delay_policy(self.recovery_policy.clone())
        .scheduler(self.scheduler.clone())
        .retry_if(|e| e.is_retryable())
        .build();
        *self.recovery.lock() = Some(handle.canceller());

        self.scheduler.spawn(async move {
            match handle.await {
                Ok(()) => info!("Locator recovered"),
                Err(TransportError::Cancelled { .. }) | Err(TransportError::Closed { .. }) => {
                    debug!("Locator recovery stopped")
                }
                Err(e) => error!(error = %e, "Locator recovery failed"),
            }
        });
    }
}

impl std::fmt::Debug for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locator")
            .field("addresses", &self.inner.addresses)
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::recovery::FixedDelay;
    use network::transports::MockTransport;
    use network::ResponseCode;
    use std::time::Duration;

    async fn locator(transport: &MockTransport, addresses: Vec<Address>) -> Result<Locator> {
        Locator::connect(
            Arc::new(transport.clone()),
            addresses,
            "test",
            Arc::new(FixedDelay::new(Duration::from_millis(100))),
            Handle::current(),
        )
        .await
    }

    #[tokio::test]
    async fn test_connect_tries_addresses_in_order() {
        let transport = MockTransport::new();
        transport.refuse_address(Address::new("node-1", 5552));

        let locator = locator(
            &transport,
            vec![Address::new("node-1", 5552), Address::new("node-2", 5552)],
        )
        .await
        .unwrap();

        assert!(locator.is_available());
        assert_eq!(transport.open_attempts(), 2);
        assert_eq!(
            transport.open_connections()[0].address(),
            &Address::new("node-2", 5552)
        );
    }

    #[tokio::test]
    async fn test_connect_returns_last_error() {
        let transport = MockTransport::new();
        transport.refuse_connections(true);

        let err = locator(&transport, vec![Address::new("a", 1), Address::new("b", 2)])
            .await
            .unwrap_err();
        match err {
            TransportError::Connection { address, .. } => assert_eq!(address.as_deref(), Some("b:2")),
            other => panic!("Expected Connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leader_resolution() {
        let leader = Address::new("node-3", 5552);
        let transport = MockTransport::new().with_stream("orders", leader.clone());
        let locator = locator(&transport, vec![Address::default()]).await.unwrap();

        assert_eq!(locator.leader_for("orders").await.unwrap(), leader);
        assert!(matches!(
            locator.leader_for("missing").await,
            Err(TransportError::StreamUnavailable { .. })
        ));

        transport.set_metadata(StreamMetadata {
            stream: "leaderless".to_string(),
            code: ResponseCode::Ok,
            leader: None,
            replicas: vec![leader],
        });
        assert!(matches!(
            locator.leader_for("leaderless").await,
            Err(TransportError::StreamUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_unexpected_loss() {
        let transport = MockTransport::new().with_stream("orders", Address::default());
        let locator = locator(&transport, vec![Address::default()]).await.unwrap();

        transport.fail_next_opens(2);
        transport.connections()[0].kill();
        assert!(!locator.is_available());
        assert!(matches!(
            locator.leader_for("orders").await,
            Err(TransportError::Unavailable { .. })
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(locator.is_available());
        assert_eq!(transport.open_attempts(), 4);
        assert!(locator.leader_for("orders").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = MockTransport::new();
        let locator = locator(&transport, vec![Address::default()]).await.unwrap();

        locator.close().await;
        locator.close().await;
        assert!(matches!(
            locator.connection(),
            Err(TransportError::Closed { .. })
        ));
        assert!(transport.open_connections().is_empty());
    }
}
