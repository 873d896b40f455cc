//! Producers Coordinator
//!
//! Multiplexes logical producers onto shared connections to the leader of
//! their stream. When a connection drops unexpectedly every producer on it
//! is recovered independently through the retry engine: re-resolve the
//! leader, attach to a live connection (opening one if needed), rebind.
//! A metadata update for a stream moves its producers the same way, paced
//! by the topology policy instead of the recovery policy.

use crate::lifecycle::{BindOutcome, EntityState, Lifecycle};
use crate::locator::Locator;
use crate::pool::ConnectionPool;
use codec::EncodedMessage;
use network::recovery::{async_retry, BackoffPolicy};
use network::{
    ConnectionListener, MetricsCollector, ResponseCode, Result, ShutdownReason, Transport,
    TransportError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

pub(crate) struct ProducerTracker {
    id: u64,
    stream: String,
    lifecycle: Lifecycle<Arc<ProducerTracker>>,
    unconfirmed: AtomicU64,
    settled: Notify,
}

impl ProducerTracker {
    fn new(id: u64, stream: &str) -> Self {
        Self {
            id,
            stream: stream.to_string(),
            lifecycle: Lifecycle::new(format!("producer {} on stream '{}'", id, stream)),
            unconfirmed: AtomicU64::new(0),
            settled: Notify::new(),
        }
    }

    /// Confirmed or failed publishes no longer count as outstanding
    fn settle(&self, count: u64) {
        let previous = self
            .unconfirmed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            })
            .unwrap_or(0);
        if previous <= count {
            self.settled.notify_waiters();
        }
    }

    /// Forget outstanding publishes; returns how many were dropped
    fn abandon_unconfirmed(&self) -> u64 {
        let lost = self.unconfirmed.swap(0, Ordering::AcqRel);
        self.settled.notify_waiters();
        lost
    }
}

/// Shared settings for both multiplexing coordinators
#[derive(Clone)]
pub struct CoordinatorSettings {
    pub transport: Arc<dyn Transport>,
    pub locator: Locator,
    pub client_name: String,
    pub max_by_connection: usize,
    pub recovery_policy: Arc<dyn BackoffPolicy>,
    /// Pace of re-placement after a metadata update
    pub topology_policy: Arc<dyn BackoffPolicy>,
    pub scheduler: Handle,
    pub metrics: Arc<dyn MetricsCollector>,
}

struct ProducersInner {
    pool: ConnectionPool<Arc<ProducerTracker>>,
    locator: Locator,
    recovery_policy: Arc<dyn BackoffPolicy>,
    topology_policy: Arc<dyn BackoffPolicy>,
    scheduler: Handle,
    metrics: Arc<dyn MetricsCollector>,
    trackers: Mutex<HashMap<u64, Arc<ProducerTracker>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Assigns producers to connections and recovers them after failures
pub struct ProducersCoordinator {
    inner: Arc<ProducersInner>,
}

struct ProducerConnectionListener {
    coordinator: Weak<ProducersInner>,
    connection_id: u64,
}

impl ConnectionListener for ProducerConnectionListener {
    fn on_publish_confirm(&self, publisher_id: u8, publishing_ids: &[u64]) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.settle(self.connection_id, publisher_id, publishing_ids.len(), true);
        }
    }

    fn on_publish_error(&self, publisher_id: u8, errors: &[(u64, ResponseCode)]) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            for (publishing_id, code) in errors {
                debug!(connection = self.connection_id, publisher_id, publishing_id, code = %code, "Publish rejected");
            }
            coordinator.settle(self.connection_id, publisher_id, errors.len(), false);
        }
    }

    fn on_metadata_update(&self, stream: &str, code: ResponseCode) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            info!(connection = self.connection_id, stream, code = %code, "Stream topology changed");
            coordinator.metadata_updated(self.connection_id, stream);
        }
    }

    fn on_shutdown(&self, reason: ShutdownReason) {
        if !reason.is_unexpected() {
            return;
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.connection_lost(self.connection_id, reason);
        }
    }
}

impl ProducersCoordinator {
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self {
            inner: Arc::new(ProducersInner {
                pool: ConnectionPool::new(
                    "producer",
                    settings.transport,
                    &settings.client_name,
                    settings.max_by_connection,
                ),
                locator: settings.locator,
                recovery_policy: settings.recovery_policy,
                topology_policy: settings.topology_policy,
                scheduler: settings.scheduler,
                metrics: settings.metrics,
                trackers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Place a new producer for `stream`; the registration's `close` is the
    /// closing callback
    pub async fn register(&self, stream: &str) -> Result<ProducerRegistration> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("producers coordinator"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let tracker = Arc::new(ProducerTracker::new(id, stream));
        if let Err(e) = self.inner.attach(&tracker).await {
            tracker.lifecycle.close();
            return Err(e);
        }
        self.inner.trackers.lock().insert(id, tracker.clone());

        let registration = ProducerRegistration {
            tracker,
            coordinator: Arc::downgrade(&self.inner),
        };
        if self.inner.closed.load(Ordering::Acquire) {
            registration.close().await;
            return Err(TransportError::closed("producers coordinator"));
        }
        Ok(registration)
    }

    pub fn producer_count(&self) -> usize {
        self.inner.trackers.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.pool.connection_count()
    }

    /// Loads of the open connections, ordered by connection id
    pub fn connection_loads(&self) -> Vec<usize> {
        self.inner
            .pool
            .connections()
            .iter()
            .map(|connection| connection.load())
            .collect()
    }

    /// Close every producer and connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let trackers: Vec<_> = self.inner.trackers.lock().drain().map(|(_, t)| t).collect();
        for tracker in trackers {
            ProducerRegistration {
                tracker,
                coordinator: Arc::downgrade(&self.inner),
            }
            .close()
            .await;
        }
        self.inner.pool.close_all().await;
        debug!("Producers coordinator closed");
    }
}

impl ProducersInner {
    async fn attach(self: &Arc<Self>, tracker: &Arc<ProducerTracker>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("producers coordinator"));
        }

        let leader = self.locator.leader_for(&tracker.stream).await?;
        let coordinator = Arc::downgrade(self);
        let attachment = self
            .pool
            .attach(&leader, tracker.clone(), move |connection_id| {
                Arc::new(ProducerConnectionListener {
                    coordinator,
                    connection_id,
                })
            })
            .await?;

        match tracker.lifecycle.bind(&attachment) {
            BindOutcome::Bound => {
                debug!(
                    producer = tracker.id,
                    stream = %tracker.stream,
                    connection = attachment.connection.id(),
                    publisher_id = attachment.slot,
                    "Producer attached"
                );
                Ok(())
            }
            BindOutcome::Closed => {
                self.pool.release(&attachment.connection, attachment.slot).await;
                Err(TransportError::closed(tracker.lifecycle.label()))
            }
            BindOutcome::Dead => Err(TransportError::connection(
                "connection lost while attaching producer",
                Some(leader.to_string()),
            )),
        }
    }

    fn settle(&self, connection_id: u64, publisher_id: u8, count: usize, confirmed: bool) {
        let tracker = self
            .pool
            .get(connection_id)
            .and_then(|connection| connection.get(publisher_id));
        let Some(tracker) = tracker else {
            debug!(connection = connection_id, publisher_id, "Confirmation for unknown publisher");
            return;
        };

        tracker.settle(count as u64);
        if confirmed {
            self.metrics.publish_confirm(count as u64);
        } else {
            self.metrics.publish_error(count as u64);
        }
    }

    fn connection_lost(self: &Arc<Self>, connection_id: u64, reason: ShutdownReason) {
        if let Some(connection) = self.pool.get(connection_id) {
            connection.mark_dead();
        }
        warn!(connection = connection_id, reason = ?reason, "Producer connection lost");

        let coordinator = self.clone();
        self.scheduler.spawn(async move {
            let affected = coordinator.pool.retire(connection_id).await;
            info!(
                connection = connection_id,
                producers = affected.len(),
                "Recovering producers"
            );
            for (_, tracker) in affected {
                coordinator.recover(tracker, connection_id);
            }
        });
    }

    /// Detach the producers of `stream` from the connection and place them
    /// again once the new leader is known
    fn metadata_updated(self: &Arc<Self>, connection_id: u64, stream: &str) {
        let Some(connection) = self.pool.get(connection_id) else {
            return;
        };
        let moved: Vec<_> = connection
            .entries()
            .into_iter()
            .filter(|(_, tracker)| tracker.stream == stream)
            .collect();

        let coordinator = self.clone();
        self.scheduler.spawn(async move {
            for (slot, tracker) in moved {
                if !tracker.lifecycle.connection_lost(connection_id) {
                    continue;
                }
                coordinator.pool.release(&connection, slot).await;
                coordinator.start_recovery(tracker, coordinator.topology_policy.clone());
            }
        });
    }

    fn recover(self: &Arc<Self>, tracker: Arc<ProducerTracker>, lost_connection: u64) {
        if self.closed.load(Ordering::Acquire) || !tracker.lifecycle.connection_lost(lost_connection) {
            return;
        }
        self.start_recovery(tracker, self.recovery_policy.clone());
    }

    /// Re-attach a producer whose binding is already `Unavailable`
    fn start_recovery(self: &Arc<Self>, tracker: Arc<ProducerTracker>, policy: Arc<dyn BackoffPolicy>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let lost = tracker.abandon_unconfirmed();
        if lost > 0 {
            self.metrics.publish_error(lost);
        }

        let coordinator = Arc::downgrade(self);
        let target = tracker.clone();
        let handle = async_retry(move || {
            let coordinator = coordinator.clone();
            let target = target.clone();
            async move {
                let coordinator = coordinator
                    .upgrade()
                    .ok_or_else(|| TransportError::closed("producers coordinator"))?;
                coordinator.attach(&target).await
            }
        })
        .description(format!("recover {}", tracker.lifecycle.label()))
        .delay_policy(policy)
        .scheduler(self.scheduler.clone())
        .retry_if(|e| e.is_retryable())
        .build();
        tracker.lifecycle.set_recovery(handle.canceller());

        let coordinator = Arc::downgrade(self);
        self.scheduler.spawn(async move {
            match handle.await {
                Ok(()) => info!(producer = tracker.id, stream = %tracker.stream, "Producer recovered"),
                Err(e) if e.is_terminal() => {
                    debug!(producer = tracker.id, "Producer recovery stopped")
                }
                Err(e) => {
                    error!(producer = tracker.id, stream = %tracker.stream, error = %e, "Producer recovery failed");
                    let previous = tracker.lifecycle.fail(e);
                    if let Some(coordinator) = coordinator.upgrade() {
                        coordinator.trackers.lock().remove(&tracker.id);
                        if let Some(Some((connection, slot))) = previous {
                            coordinator.pool.release(&connection, slot).await;
                        }
                    }
                }
            }
        });
    }
}

/// Handle for one registered producer
pub struct ProducerRegistration {
    tracker: Arc<ProducerTracker>,
    coordinator: Weak<ProducersInner>,
}

impl ProducerRegistration {
    pub fn id(&self) -> u64 {
        self.tracker.id
    }

    pub fn stream(&self) -> &str {
        &self.tracker.stream
    }

    pub fn state(&self) -> EntityState {
        self.tracker.lifecycle.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<EntityState> {
        self.tracker.lifecycle.subscribe_state()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.lifecycle.is_closed()
    }

    /// Id of the connection currently carrying this producer
    pub fn connection_id(&self) -> Option<u64> {
        self.tracker.lifecycle.connection_id()
    }

    /// Publishes sent but not yet confirmed or rejected
    pub fn unconfirmed(&self) -> u64 {
        self.tracker.unconfirmed.load(Ordering::Acquire)
    }

    /// Publish on the current connection; `Unavailable` while recovering
    pub async fn publish(&self, messages: Vec<EncodedMessage>) -> Result<Vec<u64>> {
        let coordinator = self
            .coordinator
            .upgrade()
            .ok_or_else(|| TransportError::closed("producers coordinator"))?;
        let (connection, publisher_id) = self.tracker.lifecycle.current()?;

        let count = messages.len() as u64;
        self.tracker.unconfirmed.fetch_add(count, Ordering::AcqRel);
        coordinator.metrics.publish(count);

        match connection.connection().publish(publisher_id, messages).await {
            Ok(ids) => Ok(ids),
            Err(e) => {
                self.tracker.settle(count);
                coordinator.metrics.publish_error(count);
                Err(e)
            }
        }
    }

    /// Wait until every publish so far is confirmed, rejected or abandoned
    pub async fn wait_confirmed(&self) {
        loop {
            let settled = self.tracker.settled.notified();
            if self.unconfirmed() == 0 || self.is_closed() {
                return;
            }
            settled.await;
        }
    }

    /// Detach from the connection and release the publisher id. Idempotent.
    pub async fn close(&self) {
        let Some(previous) = self.tracker.lifecycle.close() else {
            return;
        };
        self.tracker.settled.notify_waiters();

        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.trackers.lock().remove(&self.tracker.id);
            if let Some((connection, slot)) = previous {
                coordinator.pool.release(&connection, slot).await;
            }
        }
        debug!(producer = self.tracker.id, stream = %self.tracker.stream, "Producer closed");
    }
}

impl std::fmt::Debug for ProducerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistration")
            .field("id", &self.tracker.id)
            .field("stream", &self.tracker.stream)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use network::recovery::{FixedDelay, FixedWithInitialDelay};
    use network::transports::MockTransport;
    use network::{Address, Connection, CountingMetricsCollector};
    use std::time::Duration;

    async fn coordinator(
        transport: &MockTransport,
        capacity: usize,
        metrics: Arc<CountingMetricsCollector>,
    ) -> ProducersCoordinator {
        let locator = Locator::connect(
            Arc::new(transport.clone()),
            vec![Address::default()],
            "test",
            Arc::new(FixedDelay::new(Duration::from_millis(100))),
            Handle::current(),
        )
        .await
        .unwrap();

        ProducersCoordinator::new(CoordinatorSettings {
            transport: Arc::new(transport.clone()),
            locator,
            client_name: "test".to_string(),
            max_by_connection: capacity,
            recovery_policy: Arc::new(FixedDelay::new(Duration::from_millis(100))),
            topology_policy: Arc::new(FixedWithInitialDelay::new(
                Duration::from_millis(200),
                Duration::from_millis(100),
            )),
            scheduler: Handle::current(),
            metrics,
        })
    }

    fn payload() -> Vec<EncodedMessage> {
        vec![EncodedMessage::new(Bytes::from_static(b"frame"))]
    }

    #[tokio::test]
    async fn test_capacity_bound_and_minimum_connections() {
        let transport = MockTransport::new().with_stream("orders", Address::default());
        let coordinator = coordinator(&transport, 3, Arc::default()).await;

        let mut registrations = Vec::new();
        for _ in 0..10 {
            registrations.push(coordinator.register("orders").await.unwrap());
        }

        assert_eq!(coordinator.connection_count(), 4);
        assert_eq!(coordinator.connection_loads(), vec![3, 3, 3, 1]);
        assert_eq!(transport.connections_named("test-producer").len(), 4);
    }

    #[tokio::test]
    async fn test_register_on_missing_stream_fails() {
        let transport = MockTransport::new();
        let coordinator = coordinator(&transport, 3, Arc::default()).await;

        assert!(matches!(
            coordinator.register("missing").await,
            Err(TransportError::StreamUnavailable { .. })
        ));
        assert_eq!(coordinator.producer_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_and_confirm_tracking() {
        let transport = MockTransport::new().with_stream("orders", Address::default());
        let metrics = Arc::new(CountingMetricsCollector::new());
        let coordinator = coordinator(&transport, 3, metrics.clone()).await;
        let producer = coordinator.register("orders").await.unwrap();

        let ids = producer.publish(payload()).await.unwrap();
        assert_eq!(ids, vec![0]);
        assert_eq!(producer.unconfirmed(), 1);

        let connection = transport.connections_named("test-producer")[0].clone();
        connection.confirm(0, &ids);
        producer.wait_confirmed().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.confirmed, 1);
        assert_eq!(snapshot.outstanding_confirms, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_id() {
        let transport = MockTransport::new().with_stream("orders", Address::default());
        let coordinator = coordinator(&transport, 3, Arc::default()).await;
        let first = coordinator.register("orders").await.unwrap();
        let second = coordinator.register("orders").await.unwrap();

        first.close().await;
        first.close().await;
        assert_eq!(coordinator.connection_loads(), vec![1]);
        assert!(matches!(
            first.publish(payload()).await,
            Err(TransportError::Closed { .. })
        ));

        // The released id is handed out again
        let third = coordinator.register("orders").await.unwrap();
        assert_eq!(coordinator.connection_loads(), vec![2]);
        assert_eq!(third.connection_id(), second.connection_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producers_recover_after_connection_loss() {
        let transport = MockTransport::new().with_stream("orders", Address::default());
        let metrics = Arc::new(CountingMetricsCollector::new());
        let coordinator = coordinator(&transport, 5, metrics.clone()).await;

        let first = coordinator.register("orders").await.unwrap();
        let second = coordinator.register("orders").await.unwrap();
        first.publish(payload()).await.unwrap();

        transport.fail_next_opens(1);
        transport.connections_named("test-producer")[0].kill();

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(first.state().is_running());
        assert!(second.state().is_running());
        assert_eq!(first.connection_id(), second.connection_id());
        assert_eq!(coordinator.connection_count(), 1);
        assert_eq!(metrics.snapshot().errored, 1);
        assert!(first.publish(payload()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_update_moves_producers_to_new_leader() {
        let transport = MockTransport::new()
            .with_stream("orders", Address::default())
            .with_stream("audit", Address::default());
        let coordinator = coordinator(&transport, 5, Arc::default()).await;
        let orders = coordinator.register("orders").await.unwrap();
        let audit = coordinator.register("audit").await.unwrap();
        let original = orders.connection_id();

        let leader = Address::new("node-2", 5552);
        transport.set_leader("orders", leader.clone());
        transport.connections_named("test-producer")[0].metadata_update("orders");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orders.state().is_running());
        assert!(audit.state().is_running());
        assert_ne!(orders.connection_id(), original);
        assert_eq!(audit.connection_id(), original);
        let moved = transport.connections_named("test-producer")[1].clone();
        assert_eq!(moved.address(), &leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_recovery() {
        let transport = MockTransport::new().with_stream("orders", Address::default());
        let coordinator = coordinator(&transport, 5, Arc::default()).await;
        let producer = coordinator.register("orders").await.unwrap();

        transport.refuse_connections(true);
        transport.connections_named("test-producer")[0].kill();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(matches!(producer.state(), EntityState::Recovering));

        producer.close().await;
        let attempts = transport.open_attempts();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.open_attempts(), attempts);
        assert!(matches!(producer.state(), EntityState::Closed));
    }
}
