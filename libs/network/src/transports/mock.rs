//! In-memory transport for tests
//!
//! `MockTransport` keeps a shared fake broker (streams, leaders, stored
//! offsets) and records every call made on the connections it opens. Tests
//! drive the listener side directly with `deliver`, `confirm` and `kill`.

use super::{Connection, ConnectionListener, ConnectionParameters, Transport};
use crate::protocol::{
    Address, Chunk, OffsetSpecification, ResponseCode, ShutdownReason, StreamMetadata,
};
use crate::{Result, TransportError};
use async_trait::async_trait;
use codec::EncodedMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Call recorded by a [`MockConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Subscribe {
        subscription_id: u8,
        stream: String,
        offset: OffsetSpecification,
    },
    Unsubscribe {
        subscription_id: u8,
    },
    Publish {
        publisher_id: u8,
        count: usize,
    },
    QueryOffset {
        reference: String,
        stream: String,
    },
    StoreOffset {
        reference: String,
        stream: String,
        offset: u64,
    },
    Metadata {
        streams: Vec<String>,
    },
    CreateStream {
        stream: String,
    },
    DeleteStream {
        stream: String,
    },
    Close,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, StreamMetadata>,
    offsets: HashMap<(String, String), u64>,
    open_attempts: usize,
    failing_opens: usize,
    refuse_all: bool,
    refused: HashSet<Address>,
    refused_subscriptions: HashSet<String>,
    failing_store_offsets: usize,
    store_offset_delay: Option<Duration>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    stores_in_flight: AtomicUsize,
    max_stores_in_flight: AtomicUsize,
}

/// Fake transport backed by an in-memory broker
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream led by `leader`
    pub fn with_stream(self, stream: &str, leader: Address) -> Self {
        self.set_leader(stream, leader);
        self
    }

    /// Create the stream or move its leader
    pub fn set_leader(&self, stream: &str, leader: Address) {
        self.shared
            .state
            .lock()
            .streams
            .insert(stream.to_string(), StreamMetadata::new(stream, leader));
    }

    pub fn set_metadata(&self, metadata: StreamMetadata) {
        self.shared
            .state
            .lock()
            .streams
            .insert(metadata.stream.clone(), metadata);
    }

    pub fn remove_stream(&self, stream: &str) {
        self.shared.state.lock().streams.remove(stream);
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        self.shared.state.lock().streams.contains_key(stream)
    }

    /// Fail the next `count` open attempts
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.state.lock().failing_opens = count;
    }

    /// Refuse every open attempt until switched back
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().refuse_all = refuse;
    }

    /// Refuse opens to one address
    pub fn refuse_address(&self, address: Address) {
        self.shared.state.lock().refused.insert(address);
    }

    /// Answer subscriptions to `stream` with `AccessRefused`
    pub fn refuse_subscriptions(&self, stream: &str) {
        self.shared
            .state
            .lock()
            .refused_subscriptions
            .insert(stream.to_string());
    }

    /// Fail the next `count` store offset calls
    pub fn fail_next_store_offsets(&self, count: usize) {
        self.shared.state.lock().failing_store_offsets = count;
    }

    /// Make every store offset call take `delay`
    pub fn set_store_offset_delay(&self, delay: Duration) {
        self.shared.state.lock().store_offset_delay = Some(delay);
    }

    pub fn set_stored_offset(&self, reference: &str, stream: &str, offset: u64) {
        self.shared
            .state
            .lock()
            .offsets
            .insert((reference.to_string(), stream.to_string()), offset);
    }

    pub fn stored_offset(&self, reference: &str, stream: &str) -> Option<u64> {
        self.shared
            .state
            .lock()
            .offsets
            .get(&(reference.to_string(), stream.to_string()))
            .copied()
    }

    /// Highest number of store offset calls observed running at once
    pub fn max_concurrent_store_offsets(&self) -> usize {
        self.shared.max_stores_in_flight.load(Ordering::SeqCst)
    }

    pub fn open_attempts(&self) -> usize {
        self.shared.state.lock().open_attempts
    }

    /// Every connection opened so far, in opening order
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.shared.connections.lock().clone()
    }

    pub fn open_connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections()
            .into_iter()
            .filter(|connection| connection.is_open())
            .collect()
    }

    /// Connections whose client name starts with `prefix`
    pub fn connections_named(&self, prefix: &str) -> Vec<Arc<MockConnection>> {
        self.connections()
            .into_iter()
            .filter(|connection| connection.client_name.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, parameters: ConnectionParameters) -> Result<Arc<dyn Connection>> {
        {
            let mut state = self.shared.state.lock();
            state.open_attempts += 1;
            let refused = state.refuse_all || state.refused.contains(&parameters.address);
            if refused || state.failing_opens > 0 {
                state.failing_opens = state.failing_opens.saturating_sub(1);
                return Err(TransportError::connection(
                    "connection refused",
                    Some(parameters.address.to_string()),
                ));
            }
        }

        let connection = Arc::new(MockConnection {
            address: parameters.address,
            client_name: parameters.client_name,
            listener: parameters.listener,
            shared: Arc::downgrade(&self.shared),
            open: AtomicBool::new(true),
            shutdown_notified: AtomicBool::new(false),
            next_publishing_id: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        });
        self.shared.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Connection handed out by [`MockTransport`]
pub struct MockConnection {
    address: Address,
    client_name: String,
    listener: Arc<dyn ConnectionListener>,
    shared: Weak<Shared>,
    open: AtomicBool,
    shutdown_notified: AtomicBool,
    next_publishing_id: AtomicU64,
    subscriptions: Mutex<HashMap<u8, String>>,
    calls: Mutex<Vec<MockCall>>,
    published: Mutex<Vec<(u8, EncodedMessage)>>,
}

impl MockConnection {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Subscribe calls in order: (subscription id, stream, offset)
    pub fn subscribe_calls(&self) -> Vec<(u8, String, OffsetSpecification)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Subscribe {
                    subscription_id,
                    stream,
                    offset,
                } => Some((subscription_id, stream, offset)),
                _ => None,
            })
            .collect()
    }

    /// Subscription ids currently active on this connection
    pub fn active_subscriptions(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.subscriptions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Messages published on this connection with their publisher id
    pub fn published(&self) -> Vec<(u8, EncodedMessage)> {
        self.published.lock().clone()
    }

    /// Break the connection as if the socket died
    pub fn kill(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.notify_shutdown(ShutdownReason::Unknown("connection reset".to_string()));
        }
    }

    /// Push a chunk to the listener
    pub fn deliver(&self, subscription_id: u8, chunk: Chunk) {
        self.listener.on_chunk(subscription_id, chunk);
    }

    /// Announce a topology change for `stream`, dropping its subscriptions
    /// on this connection the way the broker does
    pub fn metadata_update(&self, stream: &str) {
        self.subscriptions
            .lock()
            .retain(|_, subscribed| subscribed.as_str() != stream);
        self.listener
            .on_metadata_update(stream, ResponseCode::StreamNotAvailable);
    }

    pub fn confirm(&self, publisher_id: u8, publishing_ids: &[u64]) {
        self.listener.on_publish_confirm(publisher_id, publishing_ids);
    }

    pub fn reject(&self, publisher_id: u8, errors: &[(u64, ResponseCode)]) {
        self.listener.on_publish_error(publisher_id, errors);
    }

    fn notify_shutdown(&self, reason: ShutdownReason) {
        if !self.shutdown_notified.swap(true, Ordering::SeqCst) {
            self.listener.on_shutdown(reason);
        }
    }

    fn record(&self, call: MockCall) -> Result<Arc<Shared>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::connection(
                "connection closed",
                Some(self.address.to_string()),
            ));
        }
        self.calls.lock().push(call);
        self.shared
            .upgrade()
            .ok_or_else(|| TransportError::closed("mock transport"))
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn address(&self) -> &Address {
        &self.address
    }

    fn client_name(&self) -> &str {
        &self.client_name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        subscription_id: u8,
        stream: &str,
        offset: OffsetSpecification,
    ) -> Result<ResponseCode> {
        let shared = self.record(MockCall::Subscribe {
            subscription_id,
            stream: stream.to_string(),
            offset,
        })?;
        {
            let state = shared.state.lock();
            if !state.streams.contains_key(stream) {
                return Ok(ResponseCode::StreamDoesNotExist);
            }
            if state.refused_subscriptions.contains(stream) {
                return Ok(ResponseCode::AccessRefused);
            }
        }
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(&subscription_id) {
            return Ok(ResponseCode::SubscriptionIdAlreadyExists);
        }
        subscriptions.insert(subscription_id, stream.to_string());
        Ok(ResponseCode::Ok)
    }

    async fn unsubscribe(&self, subscription_id: u8) -> Result<ResponseCode> {
        self.record(MockCall::Unsubscribe { subscription_id })?;
        if self.subscriptions.lock().remove(&subscription_id).is_some() {
            Ok(ResponseCode::Ok)
        } else {
            Ok(ResponseCode::SubscriptionIdDoesNotExist)
        }
    }

    async fn publish(&self, publisher_id: u8, messages: Vec<EncodedMessage>) -> Result<Vec<u64>> {
        self.record(MockCall::Publish {
            publisher_id,
            count: messages.len(),
        })?;
        let first = self
            .next_publishing_id
            .fetch_add(messages.len() as u64, Ordering::SeqCst);
        let ids = (first..first + messages.len() as u64).collect();
        self.published
            .lock()
            .extend(messages.into_iter().map(|message| (publisher_id, message)));
        Ok(ids)
    }

    async fn query_offset(&self, reference: &str, stream: &str) -> Result<Option<u64>> {
        let shared = self.record(MockCall::QueryOffset {
            reference: reference.to_string(),
            stream: stream.to_string(),
        })?;
        let state = shared.state.lock();
        Ok(state
            .offsets
            .get(&(reference.to_string(), stream.to_string()))
            .copied())
    }

    async fn store_offset(&self, reference: &str, stream: &str, offset: u64) -> Result<()> {
        let shared = self.record(MockCall::StoreOffset {
            reference: reference.to_string(),
            stream: stream.to_string(),
            offset,
        })?;

        let in_flight = shared.stores_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared
            .max_stores_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let (fail, delay) = {
            let mut state = shared.state.lock();
            let fail = state.failing_store_offsets > 0;
            state.failing_store_offsets = state.failing_store_offsets.saturating_sub(1);
            (fail, state.store_offset_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if fail {
            Err(TransportError::timeout("store offset", 0))
        } else {
            shared
                .state
                .lock()
                .offsets
                .insert((reference.to_string(), stream.to_string()), offset);
            Ok(())
        };
        shared.stores_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn metadata(&self, streams: &[String]) -> Result<HashMap<String, StreamMetadata>> {
        let shared = self.record(MockCall::Metadata {
            streams: streams.to_vec(),
        })?;
        let state = shared.state.lock();
        Ok(streams
            .iter()
            .map(|stream| {
                let metadata = state
                    .streams
                    .get(stream)
                    .cloned()
                    .unwrap_or_else(|| StreamMetadata::missing(stream.clone()));
                (stream.clone(), metadata)
            })
            .collect())
    }

    async fn create_stream(&self, stream: &str) -> Result<ResponseCode> {
        let shared = self.record(MockCall::CreateStream {
            stream: stream.to_string(),
        })?;
        let mut state = shared.state.lock();
        if state.streams.contains_key(stream) {
            return Ok(ResponseCode::StreamAlreadyExists);
        }
        state.streams.insert(
            stream.to_string(),
            StreamMetadata::new(stream, self.address.clone()),
        );
        Ok(ResponseCode::Ok)
    }

    async fn delete_stream(&self, stream: &str) -> Result<ResponseCode> {
        let shared = self.record(MockCall::DeleteStream {
            stream: stream.to_string(),
        })?;
        if shared.state.lock().streams.remove(stream).is_some() {
            Ok(ResponseCode::Ok)
        } else {
            Ok(ResponseCode::StreamDoesNotExist)
        }
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().push(MockCall::Close);
        if self.open.swap(false, Ordering::SeqCst) {
            self.notify_shutdown(ShutdownReason::ClientClose);
        }
        Ok(())
    }
}
