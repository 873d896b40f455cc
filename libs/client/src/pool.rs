//! Connection Pool
//!
//! Shared placement logic for the producers and consumers coordinators.
//! Opening a connection runs under a lock for its broker address, so
//! concurrent registrations toward one broker never open more connections
//! than the capacity bound needs while other brokers stay unaffected.
//! Everything else is synchronous so listener callbacks can look connections
//! up by id.

use crate::managed_connection::ManagedConnection;
use network::{Address, ConnectionListener, ConnectionParameters, Result, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entity placed on a connection under a connection-local id
pub(crate) struct Attachment<T> {
    pub connection: Arc<ManagedConnection<T>>,
    pub slot: u8,
}

struct Connections<T> {
    by_id: BTreeMap<u64, Arc<ManagedConnection<T>>>,
    closed: bool,
}

pub(crate) struct ConnectionPool<T> {
    /// "producer" or "consumer", used in connection names and logs
    kind: &'static str,
    transport: Arc<dyn Transport>,
    client_name: String,
    capacity: usize,
    next_id: AtomicU64,
    /// One opener at a time per broker address
    placements: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
    connections: RwLock<Connections<T>>,
}

impl<T: Clone> ConnectionPool<T> {
    pub fn new(
        kind: &'static str,
        transport: Arc<dyn Transport>,
        client_name: &str,
        capacity: usize,
    ) -> Self {
        Self {
            kind,
            transport,
            client_name: client_name.to_string(),
            capacity,
            next_id: AtomicU64::new(0),
            placements: Mutex::new(HashMap::new()),
            connections: RwLock::new(Connections {
                by_id: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<ManagedConnection<T>>> {
        self.connections.read().by_id.get(&id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<ManagedConnection<T>>> {
        self.connections.read().by_id.values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().by_id.len()
    }

    /// Attach to the least-loaded live connection to `address`
    fn attach_existing(&self, address: &Address, entity: &T) -> Option<Attachment<T>> {
        let candidates: Vec<_> = {
            let connections = self.connections.read();
            let mut candidates: Vec<_> = connections
                .by_id
                .values()
                .filter(|connection| connection.address() == address && connection.has_capacity())
                .cloned()
                .collect();
            candidates.sort_by_key(|connection| (connection.load(), connection.id()));
            candidates
        };

        // A candidate may fill up or retire between the read and the attach
        candidates.into_iter().find_map(|connection| {
            let slot = connection.attach(entity.clone())?;
            debug!(
                kind = self.kind,
                connection = connection.id(),
                slot,
                load = connection.load(),
                "Attached to existing connection"
            );
            Some(Attachment { connection, slot })
        })
    }

    fn placement_lock(&self, address: &Address) -> Arc<tokio::sync::Mutex<()>> {
        self.placements
            .lock()
            .entry(address.clone())
            .or_default()
            .clone()
    }

    /// Attach `entity` to the least-loaded live connection to `address`,
    /// opening a new one when all of them are full
    ///
    /// `listener` builds the listener for a new connection from its id.
    pub async fn attach(
        &self,
        address: &Address,
        entity: T,
        listener: impl FnOnce(u64) -> Arc<dyn ConnectionListener>,
    ) -> Result<Attachment<T>> {
        if let Some(attachment) = self.attach_existing(address, &entity) {
            return Ok(attachment);
        }

        let placement = self.placement_lock(address);
        let _placement = placement.lock().await;
        if let Some(attachment) = self.attach_existing(address, &entity) {
            return Ok(attachment);
        }
        if self.connections.read().closed {
            return Err(TransportError::closed(format!("{} connection pool", self.kind)));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client_name = format!("{}-{}-{}", self.client_name, self.kind, id);
        let opened = self
            .transport
            .open(ConnectionParameters {
                address: address.clone(),
                client_name: client_name.clone(),
                listener: listener(id),
            })
            .await?;
        info!(kind = self.kind, connection = id, address = %address, name = %client_name, "Opened connection");

        let connection = Arc::new(ManagedConnection::new(
            id,
            address.clone(),
            opened,
            self.capacity,
        ));
        let slot = connection.attach(entity).ok_or_else(|| {
            TransportError::connection("new connection refused attachment", Some(address.to_string()))
        })?;

        let inserted = {
            let mut connections = self.connections.write();
            if !connections.closed {
                connections.by_id.insert(id, connection.clone());
            }
            !connections.closed
        };
        if !inserted {
            connection.drain();
            if let Err(e) = connection.connection().close().await {
                warn!(kind = self.kind, connection = id, error = %e, "Failed to close connection");
            }
            return Err(TransportError::closed(format!("{} connection pool", self.kind)));
        }
        Ok(Attachment { connection, slot })
    }

    /// Release an id; closes the connection once nothing is attached to it
    pub async fn release(&self, connection: &Arc<ManagedConnection<T>>, slot: u8) -> Option<T> {
        let (entity, idle) = connection.release(slot);

        if idle {
            self.connections.write().by_id.remove(&connection.id());
            debug!(kind = self.kind, connection = connection.id(), "Closing idle connection");
            if let Err(e) = connection.connection().close().await {
                warn!(kind = self.kind, connection = connection.id(), error = %e, "Failed to close idle connection");
            }
        }
        entity
    }

    /// Remove a lost connection and hand back everything that was on it
    pub async fn retire(&self, id: u64) -> Vec<(u8, T)> {
        let removed = self.connections.write().by_id.remove(&id);
        match removed {
            Some(connection) => connection.drain(),
            None => Vec::new(),
        }
    }

    /// Close every connection; attached entities are dropped and no new
    /// connection is opened afterwards
    pub async fn close_all(&self) {
        let connections: Vec<_> = {
            let mut connections = self.connections.write();
            connections.closed = true;
            std::mem::take(&mut connections.by_id).into_values().collect()
        };

        for connection in connections {
            connection.drain();
            if let Err(e) = connection.connection().close().await {
                warn!(kind = self.kind, connection = connection.id(), error = %e, "Failed to close connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use network::transports::MockTransport;
    use network::{Connection, ShutdownReason};
    use std::time::Duration;

    struct Quiet;

    impl ConnectionListener for Quiet {
        fn on_shutdown(&self, _reason: ShutdownReason) {}
    }

    fn quiet(_id: u64) -> Arc<dyn ConnectionListener> {
        Arc::new(Quiet)
    }

    fn pool(transport: &MockTransport, capacity: usize) -> ConnectionPool<u32> {
        ConnectionPool::new("producer", Arc::new(transport.clone()), "test", capacity)
    }

    #[tokio::test]
    async fn test_opens_minimum_connections() {
        let transport = MockTransport::new();
        let pool = pool(&transport, 3);
        let address = Address::default();

        for entity in 0..7u32 {
            pool.attach(&address, entity, quiet).await.unwrap();
        }

        assert_eq!(pool.connection_count(), 3);
        assert_eq!(transport.open_attempts(), 3);
        for connection in pool.connections() {
            assert!(connection.load() <= 3);
        }
    }

    #[tokio::test]
    async fn test_least_loaded_placement() {
        let transport = MockTransport::new();
        let pool = pool(&transport, 2);
        let address = Address::default();

        let a = pool.attach(&address, 1, quiet).await.unwrap();
        let _b = pool.attach(&address, 2, quiet).await.unwrap();
        let c = pool.attach(&address, 3, quiet).await.unwrap();
        assert_ne!(a.connection.id(), c.connection.id());

        // Free a slot on the first connection; both now hold one entity
        pool.release(&a.connection, a.slot).await;
        let d = pool.attach(&address, 4, quiet).await.unwrap();
        assert_eq!(d.connection.id(), a.connection.id());
        assert_eq!(d.slot, a.slot);
    }

    #[tokio::test]
    async fn test_separate_connections_per_address() {
        let transport = MockTransport::new();
        let pool = pool(&transport, 10);

        let a = pool.attach(&Address::new("node-1", 5552), 1, quiet).await.unwrap();
        let b = pool.attach(&Address::new("node-2", 5552), 2, quiet).await.unwrap();
        assert_ne!(a.connection.id(), b.connection.id());
    }

    #[tokio::test]
    async fn test_release_closes_idle_connection() {
        let transport = MockTransport::new();
        let pool = pool(&transport, 2);
        let attachment = pool.attach(&Address::default(), 1, quiet).await.unwrap();

        assert_eq!(pool.release(&attachment.connection, attachment.slot).await, Some(1));
        assert_eq!(pool.release(&attachment.connection, attachment.slot).await, None);
        assert_eq!(pool.connection_count(), 0);
        assert!(transport.open_connections().is_empty());
    }

    #[tokio::test]
    async fn test_retire_drains_entities() {
        let transport = MockTransport::new();
        let pool = pool(&transport, 4);
        let address = Address::default();
        let first = pool.attach(&address, 10, quiet).await.unwrap();
        pool.attach(&address, 11, quiet).await.unwrap();

        let drained = pool.retire(first.connection.id()).await;
        assert_eq!(drained, vec![(0, 10), (1, 11)]);
        assert_eq!(pool.connection_count(), 0);
        assert!(pool.retire(first.connection.id()).await.is_empty());

        // A fresh attachment opens a new connection
        let next = pool.attach(&address, 12, quiet).await.unwrap();
        assert_ne!(next.connection.id(), first.connection.id());
    }

    /// Opens towards host `slow` take a minute
    struct SlowHost(MockTransport);

    #[async_trait]
    impl Transport for SlowHost {
        async fn open(&self, parameters: ConnectionParameters) -> Result<Arc<dyn Connection>> {
            if parameters.address.host == "slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.0.open(parameters).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_broker_does_not_block_other_placements() {
        let transport = MockTransport::new();
        let pool = Arc::new(ConnectionPool::<u32>::new(
            "consumer",
            Arc::new(SlowHost(transport.clone())),
            "test",
            1,
        ));
        let fast = Address::new("fast", 5552);
        let existing = pool.attach(&fast, 1, quiet).await.unwrap();

        let stalled = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.attach(&Address::new("slow", 5552), 2, quiet).await })
        };
        tokio::task::yield_now().await;

        let placed = tokio::time::timeout(Duration::from_secs(1), pool.attach(&fast, 3, quiet)).await;
        assert!(placed.is_ok_and(|attachment| attachment.is_ok()));
        let released =
            tokio::time::timeout(Duration::from_secs(1), pool.release(&existing.connection, existing.slot)).await;
        assert_eq!(released.ok(), Some(Some(1)));
        assert!(!stalled.is_finished());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(stalled.await.unwrap().is_ok());
        assert_eq!(pool.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_attaches_share_connections() {
        let transport = MockTransport::new();
        let pool = Arc::new(pool(&transport, 3));

        let attaches: Vec<_> = (0..7u32)
            .map(|entity| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.attach(&Address::default(), entity, quiet).await.map(|_| ()) })
            })
            .collect();
        for attach in attaches {
            attach.await.unwrap().unwrap();
        }

        assert_eq!(pool.connection_count(), 3);
        assert_eq!(transport.open_attempts(), 3);
    }

    #[tokio::test]
    async fn test_no_connections_after_close_all() {
        let transport = MockTransport::new();
        let pool = pool(&transport, 2);
        pool.attach(&Address::default(), 1, quiet).await.unwrap();

        pool.close_all().await;
        assert!(matches!(
            pool.attach(&Address::default(), 2, quiet).await,
            Err(TransportError::Closed { .. })
        ));
        assert!(transport.open_connections().is_empty());
    }
}
