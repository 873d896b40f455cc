//! Consumers Coordinator
//!
//! Subscriptions share connections the same way producers do, but data flows
//! the other way: a connection pushes chunks tagged with a subscription id,
//! and the coordinator hands each decoded entry to the owning handler.
//!
//! Per-subscription ordering comes from dispatching inline on the
//! connection's delivery path under a per-subscription lock. The
//! last-delivered offset is kept next to it in an atomic so handlers may read
//! it; a resubscription resumes after it following failover, and entries at
//! or below it are dropped as duplicates.
//! Subscriptions dropped by a broker metadata update are placed again with
//! the topology policy.

use crate::lifecycle::{BindOutcome, EntityState, Lifecycle};
use crate::locator::Locator;
use crate::pool::{Attachment, ConnectionPool};
use crate::producers::CoordinatorSettings;
use codec::{Codec, CodecError, Message};
use network::recovery::{async_retry, BackoffPolicy};
use network::{
    Chunk, ConnectionListener, MetricsCollector, OffsetSpecification, ResponseCode, Result,
    ShutdownReason, TransportError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where a delivered message came from
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    offset: u64,
    stream: &'a str,
}

impl<'a> MessageContext<'a> {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn stream(&self) -> &'a str {
        self.stream
    }
}

/// Callback invoked for every message, in stream order
///
/// Runs on the connection's delivery path; keep it short.
pub type MessageHandler = Arc<dyn Fn(&MessageContext<'_>, Message) + Send + Sync>;

pub(crate) struct SubscriptionTracker {
    id: u64,
    stream: String,
    reference: Option<String>,
    initial_offset: OffsetSpecification,
    handler: MessageHandler,
    /// Serialises dispatch; never held by readers of `last_delivered`
    dispatch: Mutex<()>,
    /// Last offset handed to `handler`, plus one; zero before any delivery
    last_delivered: AtomicU64,
    lifecycle: Lifecycle<Arc<SubscriptionTracker>>,
}

impl SubscriptionTracker {
    fn dispatch(
        &self,
        chunk: &Chunk,
        codec: &dyn Codec,
        metrics: &dyn MetricsCollector,
    ) -> std::result::Result<(), CodecError> {
        let _dispatch = self.dispatch.lock();
        let mut delivered = 0u64;
        let mut outcome = Ok(());
        for (offset, entry) in chunk.iter() {
            if self.last_delivered().is_some_and(|last| offset <= last) {
                continue;
            }
            let message = match codec.decode(entry) {
                Ok(message) => message,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            (self.handler)(
                &MessageContext {
                    offset,
                    stream: &self.stream,
                },
                message,
            );
            self.last_delivered
                .store(offset.saturating_add(1), Ordering::Release);
            delivered += 1;
        }

        if delivered > 0 {
            metrics.consume(delivered);
        }
        outcome
    }

    fn last_delivered(&self) -> Option<u64> {
        self.last_delivered.load(Ordering::Acquire).checked_sub(1)
    }

    /// Offset specification to (re)subscribe with, before any stored offset
    fn resume_offset(&self) -> Option<OffsetSpecification> {
        self.last_delivered()
            .map(|last| OffsetSpecification::Offset(last + 1))
    }
}

struct ConsumersInner {
    pool: ConnectionPool<Arc<SubscriptionTracker>>,
    locator: Locator,
    codec: Arc<dyn Codec>,
    recovery_policy: Arc<dyn BackoffPolicy>,
    topology_policy: Arc<dyn BackoffPolicy>,
    scheduler: Handle,
    metrics: Arc<dyn MetricsCollector>,
    trackers: Mutex<HashMap<u64, Arc<SubscriptionTracker>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Places subscriptions on connections, dispatches chunks, recovers after
/// failures
pub struct ConsumersCoordinator {
    inner: Arc<ConsumersInner>,
}

struct ConsumerConnectionListener {
    coordinator: Weak<ConsumersInner>,
    connection_id: u64,
}

impl ConnectionListener for ConsumerConnectionListener {
    fn on_chunk(&self, subscription_id: u8, chunk: Chunk) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.chunk_received(self.connection_id, subscription_id, chunk);
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
            warn!(connection = self.connection_id, reason = ?reason, "Consumer connection lost");
            coordinator.connection_lost(self.connection_id, false);
        }
    }
}

impl ConsumersCoordinator {
    pub fn new(settings: CoordinatorSettings, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: Arc::new(ConsumersInner {
                pool: ConnectionPool::new(
                    "consumer",
                    settings.transport,
                    &settings.client_name,
                    settings.max_by_connection,
                ),
                locator: settings.locator,
                codec,
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

    /// Subscribe `handler` to `stream`
    ///
    /// With a `reference`, a stored offset takes precedence over `offset`.
    pub async fn subscribe(
        &self,
        stream: &str,
        offset: OffsetSpecification,
        reference: Option<String>,
        handler: MessageHandler,
    ) -> Result<SubscriptionRegistration> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("consumers coordinator"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let tracker = Arc::new(SubscriptionTracker {
            id,
            stream: stream.to_string(),
            reference,
            initial_offset: offset,
            handler,
            dispatch: Mutex::new(()),
            last_delivered: AtomicU64::new(0),
            lifecycle: Lifecycle::new(format!("subscription {} on stream '{}'", id, stream)),
        });

        if let Err(e) = self.inner.attach(&tracker).await {
            tracker.lifecycle.close();
            return Err(e);
        }
        self.inner.trackers.lock().insert(id, tracker.clone());

        let registration = SubscriptionRegistration {
            tracker,
            coordinator: Arc::downgrade(&self.inner),
        };
        if self.inner.closed.load(Ordering::Acquire) {
            registration.close().await;
            return Err(TransportError::closed("consumers coordinator"));
        }
        Ok(registration)
    }

    pub fn subscription_count(&self) -> usize {
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

    /// Close every subscription and connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let trackers: Vec<_> = self.inner.trackers.lock().drain().map(|(_, t)| t).collect();
        for tracker in trackers {
            SubscriptionRegistration {
                tracker,
                coordinator: Arc::downgrade(&self.inner),
            }
            .close()
            .await;
        }
        self.inner.pool.close_all().await;
        debug!("Consumers coordinator closed");
    }
}

impl ConsumersInner {
    async fn attach(self: &Arc<Self>, tracker: &Arc<SubscriptionTracker>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("consumers coordinator"));
        }

        let leader = self.locator.leader_for(&tracker.stream).await?;
        let coordinator = Arc::downgrade(self);
        let attachment = self
            .pool
            .attach(&leader, tracker.clone(), move |connection_id| {
                Arc::new(ConsumerConnectionListener {
                    coordinator,
                    connection_id,
                })
            })
            .await?;

        let offset = match self.subscribe_on(tracker, &attachment).await {
            Ok(offset) => offset,
            Err(e) => {
                self.pool.release(&attachment.connection, attachment.slot).await;
                return Err(e);
            }
        };

        match tracker.lifecycle.bind(&attachment) {
            BindOutcome::Bound => {
                info!(
                    subscription = tracker.id,
                    stream = %tracker.stream,
                    connection = attachment.connection.id(),
                    subscription_id = attachment.slot,
                    offset = ?offset,
                    "Subscribed"
                );
                Ok(())
            }
            BindOutcome::Closed => {
                if let Err(e) = attachment.connection.connection().unsubscribe(attachment.slot).await {
                    debug!(subscription = tracker.id, error = %e, "Unsubscribe after close failed");
                }
                self.pool.release(&attachment.connection, attachment.slot).await;
                Err(TransportError::closed(tracker.lifecycle.label()))
            }
            BindOutcome::Dead => Err(TransportError::connection(
                "connection lost while subscribing",
                Some(leader.to_string()),
            )),
        }
    }

    async fn subscribe_on(
        &self,
        tracker: &SubscriptionTracker,
        attachment: &Attachment<Arc<SubscriptionTracker>>,
    ) -> Result<OffsetSpecification> {
        let connection = attachment.connection.connection();
        let offset = match tracker.resume_offset() {
            Some(offset) => offset,
            None => match &tracker.reference {
                Some(reference) => match connection.query_offset(reference, &tracker.stream).await? {
                    Some(stored) => OffsetSpecification::Offset(stored + 1),
                    None => tracker.initial_offset,
                },
                None => tracker.initial_offset,
            },
        };

        let code = connection
            .subscribe(attachment.slot, &tracker.stream, offset)
            .await?;
        code.ok_or_error(&format!("subscribe to stream '{}'", tracker.stream))?;
        Ok(offset)
    }

    fn chunk_received(self: &Arc<Self>, connection_id: u64, subscription_id: u8, chunk: Chunk) {
        let Some(connection) = self.pool.get(connection_id) else {
            return;
        };
        if connection.is_dead() {
            return;
        }
        let Some(tracker) = connection.get(subscription_id) else {
            debug!(connection = connection_id, subscription_id, "Chunk for unknown subscription");
            return;
        };
        if tracker.lifecycle.is_closed() {
            return;
        }

        self.metrics.chunk(chunk.len() as u64);
        if let Err(e) = tracker.dispatch(&chunk, self.codec.as_ref(), self.metrics.as_ref()) {
            error!(
                subscription = tracker.id,
                connection = connection_id,
                error = %e,
                "Undecodable entry, dropping connection"
            );
            self.connection_lost(connection_id, true);
        }
    }

    /// Retire the connection and recover its subscriptions; `close` also
    /// shuts the transport connection down
    fn connection_lost(self: &Arc<Self>, connection_id: u64, close: bool) {
        let Some(connection) = self.pool.get(connection_id) else {
            return;
        };
        if !connection.mark_dead() {
            return;
        }

        let coordinator = self.clone();
        self.scheduler.spawn(async move {
            let affected = coordinator.pool.retire(connection_id).await;
            if close {
                if let Err(e) = connection.connection().close().await {
                    debug!(connection = connection_id, error = %e, "Close of failed connection errored");
                }
            }
            info!(
                connection = connection_id,
                subscriptions = affected.len(),
                "Recovering subscriptions"
            );
            for (_, tracker) in affected {
                coordinator.recover(tracker, connection_id);
            }
        });
    }

    /// The broker already dropped these subscriptions; free their ids and
    /// subscribe again on the new leader
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

    fn recover(self: &Arc<Self>, tracker: Arc<SubscriptionTracker>, lost_connection: u64) {
        if self.closed.load(Ordering::Acquire) || !tracker.lifecycle.connection_lost(lost_connection) {
            return;
        }
        self.start_recovery(tracker, self.recovery_policy.clone());
    }

    /// Resubscribe a subscription whose binding is already `Unavailable`
    fn start_recovery(
        self: &Arc<Self>,
        tracker: Arc<SubscriptionTracker>,
        policy: Arc<dyn BackoffPolicy>,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let coordinator = Arc::downgrade(self);
        let target = tracker.clone();
        let handle = async_retry(move || {
            let coordinator = coordinator.clone();
            let target = target.clone();
            async move {
                let coordinator = coordinator
                    .upgrade()
                    .ok_or_else(|| TransportError::closed("consumers coordinator"))?;
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
                Ok(()) => info!(subscription = tracker.id, stream = %tracker.stream, "Subscription recovered"),
                Err(e) if e.is_terminal() => {
                    debug!(subscription = tracker.id, "Subscription recovery stopped")
                }
                Err(e) => {
                    error!(subscription = tracker.id, stream = %tracker.stream, error = %e, "Subscription recovery failed");
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

/// Handle for one subscription
pub struct SubscriptionRegistration {
    tracker: Arc<SubscriptionTracker>,
    coordinator: Weak<ConsumersInner>,
}

impl SubscriptionRegistration {
    pub fn id(&self) -> u64 {
        self.tracker.id
    }

    pub fn stream(&self) -> &str {
        &self.tracker.stream
    }

    pub fn reference(&self) -> Option<&str> {
        self.tracker.reference.as_deref()
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

    pub fn connection_id(&self) -> Option<u64> {
        self.tracker.lifecycle.connection_id()
    }

    /// Offset of the last entry handed to the handler
    pub fn last_delivered_offset(&self) -> Option<u64> {
        self.tracker.last_delivered()
    }

    /// Store `offset` for this subscription's reference
    pub async fn store_offset(&self, offset: u64) -> Result<()> {
        store_offset(&self.tracker, offset).await
    }

    pub(crate) fn downgrade(&self) -> WeakSubscription {
        WeakSubscription {
            tracker: Arc::downgrade(&self.tracker),
        }
    }

    /// Unsubscribe and release the subscription id. Idempotent.
    pub async fn close(&self) {
        let Some(previous) = self.tracker.lifecycle.close() else {
            return;
        };

        if let Some((connection, slot)) = previous {
            if !connection.is_dead() {
                match connection.connection().unsubscribe(slot).await {
                    Ok(code) if !code.is_ok() => {
                        warn!(subscription = self.tracker.id, code = %code, "Unsubscribe refused")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(subscription = self.tracker.id, error = %e, "Unsubscribe failed"),
                }
            }
            if let Some(coordinator) = self.coordinator.upgrade() {
                coordinator.pool.release(&connection, slot).await;
            }
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.trackers.lock().remove(&self.tracker.id);
        }
        debug!(subscription = self.tracker.id, stream = %self.tracker.stream, "Subscription closed");
    }
}

impl std::fmt::Debug for SubscriptionRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistration")
            .field("id", &self.tracker.id)
            .field("stream", &self.tracker.stream)
            .field("reference", &self.tracker.reference)
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning handle used to store offsets without keeping the
/// subscription alive
#[derive(Clone)]
pub(crate) struct WeakSubscription {
    tracker: Weak<SubscriptionTracker>,
}

impl WeakSubscription {
    pub async fn store_offset(&self, offset: u64) -> Result<()> {
        let tracker = self
            .tracker
            .upgrade()
            .ok_or_else(|| TransportError::closed("subscription"))?;
        store_offset(&tracker, offset).await
    }
}

async fn store_offset(tracker: &SubscriptionTracker, offset: u64) -> Result<()> {
    let reference = tracker.reference.as_deref().ok_or_else(|| {
        TransportError::configuration(
            format!("{} has no tracking reference", tracker.lifecycle.label()),
            Some("reference"),
        )
    })?;
    let (connection, _) = tracker.lifecycle.current()?;
    connection
        .connection()
        .store_offset(reference, &tracker.stream, offset)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::BinaryCodec;
    use network::recovery::FixedDelay;
    use network::transports::{MockCall, MockTransport};
    use network::{Address, Connection, CountingMetricsCollector};
    use std::time::Duration;

    async fn coordinator(transport: &MockTransport, capacity: usize) -> ConsumersCoordinator {
        let locator = Locator::connect(
            Arc::new(transport.clone()),
            vec![Address::default()],
            "test",
            Arc::new(FixedDelay::new(Duration::from_millis(100))),
            Handle::current(),
        )
        .await
        .unwrap();

        ConsumersCoordinator::new(
            CoordinatorSettings {
                transport: Arc::new(transport.clone()),
                locator,
                client_name: "test".to_string(),
                max_by_connection: capacity,
                recovery_policy: Arc::new(FixedDelay::new(Duration::from_millis(100))),
                topology_policy: Arc::new(FixedDelay::new(Duration::from_millis(100))),
                scheduler: Handle::current(),
                metrics: Arc::new(CountingMetricsCollector::new()),
            },
            Arc::new(BinaryCodec::new()),
        )
    }

    fn recording() -> (MessageHandler, Arc<Mutex<Vec<(u64, Bytes)>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler: MessageHandler = Arc::new(move |context: &MessageContext<'_>, message: Message| {
            sink.lock().push((context.offset(), message.body().clone()));
        });
        (handler, received)
    }

    fn chunk(first_offset: u64, bodies: &[&'static str]) -> Chunk {
        let codec = BinaryCodec::new();
        let entries = bodies
            .iter()
            .map(|body| codec.encode(&Message::new(*body)).unwrap().into_data())
            .collect();
        Chunk::new(first_offset, entries)
    }

    #[tokio::test]
    async fn test_subscribe_and_dispatch() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let (handler, received) = recording();

        let subscription = coordinator
            .subscribe("events", OffsetSpecification::First, None, handler)
            .await
            .unwrap();
        let connection = transport.connections_named("test-consumer")[0].clone();
        assert_eq!(
            connection.subscribe_calls(),
            vec![(0, "events".to_string(), OffsetSpecification::First)]
        );

        connection.deliver(0, chunk(5, &["a", "b"]));
        assert_eq!(
            *received.lock(),
            vec![(5, Bytes::from_static(b"a")), (6, Bytes::from_static(b"b"))]
        );
        assert_eq!(subscription.last_delivered_offset(), Some(6));
    }

    #[tokio::test]
    async fn test_handler_reads_own_progress() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let tracker: Arc<std::sync::OnceLock<Weak<SubscriptionTracker>>> = Arc::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handler: MessageHandler = {
            let tracker = tracker.clone();
            let seen = seen.clone();
            Arc::new(move |context: &MessageContext<'_>, _message: Message| {
                let previous = tracker
                    .get()
                    .and_then(Weak::upgrade)
                    .and_then(|tracker| tracker.last_delivered());
                seen.lock().push((context.offset(), previous));
            })
        };
        let subscription = coordinator
            .subscribe("events", OffsetSpecification::First, None, handler)
            .await
            .unwrap();
        let _ = tracker.set(Arc::downgrade(&subscription.tracker));

        let connection = transport.connections_named("test-consumer")[0].clone();
        connection.deliver(0, chunk(3, &["a", "b"]));

        assert_eq!(*seen.lock(), vec![(3, None), (4, Some(3))]);
        assert_eq!(subscription.last_delivered_offset(), Some(4));
    }

    #[tokio::test]
    async fn test_duplicates_are_skipped() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let (handler, received) = recording();
        coordinator
            .subscribe("events", OffsetSpecification::First, None, handler)
            .await
            .unwrap();

        let connection = transport.connections_named("test-consumer")[0].clone();
        connection.deliver(0, chunk(0, &["a", "b", "c"]));
        connection.deliver(0, chunk(1, &["b", "c", "d"]));

        let offsets: Vec<u64> = received.lock().iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_refused_subscription_releases_id() {
        let transport = MockTransport::new().with_stream("secret", Address::default());
        transport.refuse_subscriptions("secret");
        let coordinator = coordinator(&transport, 10).await;
        let (handler, _) = recording();

        let err = coordinator
            .subscribe("secret", OffsetSpecification::Next, None, handler)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Response {
                code: network::ResponseCode::AccessRefused,
                ..
            }
        ));
        assert_eq!(coordinator.connection_count(), 0);
        assert_eq!(coordinator.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_close_unsubscribes_once() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let (handler, _) = recording();
        let first = coordinator
            .subscribe("events", OffsetSpecification::Next, None, handler.clone())
            .await
            .unwrap();
        let _second = coordinator
            .subscribe("events", OffsetSpecification::Next, None, handler)
            .await
            .unwrap();
        let connection = transport.connections_named("test-consumer")[0].clone();

        first.close().await;
        first.close().await;

        let unsubscribes = connection
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::Unsubscribe { .. }))
            .count();
        assert_eq!(unsubscribes, 1);
        assert_eq!(connection.active_subscriptions(), vec![1]);
        assert!(matches!(first.state(), EntityState::Closed));
    }

    #[tokio::test]
    async fn test_store_offset_requires_reference() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let (handler, _) = recording();

        let anonymous = coordinator
            .subscribe("events", OffsetSpecification::Next, None, handler.clone())
            .await
            .unwrap();
        assert!(matches!(
            anonymous.store_offset(3).await,
            Err(TransportError::Configuration { .. })
        ));

        let named = coordinator
            .subscribe("events", OffsetSpecification::Next, Some("app".into()), handler)
            .await
            .unwrap();
        named.store_offset(3).await.unwrap();
        assert_eq!(transport.stored_offset("app", "events"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_last_delivered() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let (handler, received) = recording();
        let subscription = coordinator
            .subscribe("events", OffsetSpecification::First, None, handler)
            .await
            .unwrap();

        let lost = transport.connections_named("test-consumer")[0].clone();
        lost.deliver(0, chunk(0, &["a", "b", "c"]));
        lost.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(subscription.state().is_running());
        let replacement = transport.connections_named("test-consumer")[1].clone();
        assert_eq!(
            replacement.subscribe_calls(),
            vec![(0, "events".to_string(), OffsetSpecification::Offset(3))]
        );

        replacement.deliver(0, chunk(2, &["c", "d"]));
        let offsets: Vec<u64> = received.lock().iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_update_resubscribes_on_new_leader() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let (handler, received) = recording();
        let subscription = coordinator
            .subscribe("events", OffsetSpecification::Next, None, handler)
            .await
            .unwrap();

        let original = transport.connections_named("test-consumer")[0].clone();
        original.deliver(0, chunk(10, &["a", "b"]));

        let leader = Address::new("node-2", 5552);
        transport.set_leader("events", leader.clone());
        original.metadata_update("events");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(subscription.state().is_running());
        let connections = transport.connections_named("test-consumer");
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[1].address(), &leader);
        assert_eq!(
            connections[1].subscribe_calls(),
            vec![(0, "events".to_string(), OffsetSpecification::Offset(12))]
        );
        // The emptied connection is closed
        assert!(!original.is_open());
        assert_eq!(received.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_entry_forces_resubscription() {
        let transport = MockTransport::new().with_stream("events", Address::default());
        let coordinator = coordinator(&transport, 10).await;
        let (handler, received) = recording();
        coordinator
            .subscribe("events", OffsetSpecification::First, None, handler)
            .await
            .unwrap();

        let connection = transport.connections_named("test-consumer")[0].clone();
        let mut entries = chunk(0, &["a"]).entries;
        entries.push(Bytes::from_static(&[0xFF, 0x00]));
        connection.deliver(0, Chunk::new(0, entries));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(received.lock().len(), 1);
        assert!(connection.calls().contains(&MockCall::Close));
        let connections = transport.connections_named("test-consumer");
        assert_eq!(connections.len(), 2);
        assert_eq!(
            connections[1].subscribe_calls(),
            vec![(0, "events".to_string(), OffsetSpecification::Offset(1))]
        );
    }
}
