//! Environment
//!
//! Entry point of the client. Owns the locator, the producers and consumers
//! coordinators and the offset-committing coordinator, all sharing one
//! scheduler and one codec.
//!
//! ```ignore
//! let environment = Environment::builder()
//!     .config(EnvironmentConfig::load(Some(path), None)?)
//!     .transport(transport)
//!     .connect()
//!     .await?;
//!
//! let producer = environment.create_producer("orders").await?;
//! producer.send(&Message::new("payload")).await?;
//! environment.close().await;
//! ```

use crate::config::EnvironmentConfig;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::consumers::{ConsumersCoordinator, MessageContext, MessageHandler};
use crate::locator::Locator;
use crate::offset_committing::OffsetCommittingCoordinator;
use crate::producer::Producer;
use crate::producers::{CoordinatorSettings, ProducersCoordinator};
use codec::{BinaryCodec, Codec, Message};
use network::{
    MetricsCollector, NoopMetricsCollector, Result, Transport, TransportError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Collects the pieces of an [`Environment`]
#[derive(Default)]
pub struct EnvironmentBuilder {
    config: Option<EnvironmentConfig>,
    transport: Option<Arc<dyn Transport>>,
    codec: Option<Arc<dyn Codec>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    scheduler: Option<Handle>,
}

impl EnvironmentBuilder {
    pub fn config(mut self, config: EnvironmentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to [`BinaryCodec`]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Defaults to [`NoopMetricsCollector`]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runtime for recovery, timers and commits; defaults to the current one
    pub fn scheduler(mut self, scheduler: Handle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Validate the configuration and open the locator
    pub async fn connect(self) -> Result<Environment> {
        let config = self
            .config
            .unwrap_or_default()
            .validated()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), None))?;
        let addresses = config
            .parsed_addresses()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), Some("addresses")))?;
        let transport = self.transport.ok_or_else(|| {
            TransportError::configuration("a transport is required", Some("transport"))
        })?;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Handle::try_current().map_err(|_| {
                TransportError::configuration("no tokio runtime available", Some("scheduler"))
            })?,
        };
        let codec = self.codec.unwrap_or_else(|| Arc::new(BinaryCodec::new()));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(NoopMetricsCollector));

        let recovery_policy = config.recovery_backoff.to_policy();
        let topology_policy = config.topology_update_backoff.to_policy();
        let locator = Locator::connect(
            transport.clone(),
            addresses,
            &config.client_name,
            recovery_policy.clone(),
            scheduler.clone(),
        )
        .await?;

        let settings = CoordinatorSettings {
            transport,
            locator: locator.clone(),
            client_name: config.client_name.clone(),
            max_by_connection: config.max_producers_by_connection,
            recovery_policy,
            topology_policy,
            scheduler: scheduler.clone(),
            metrics: metrics.clone(),
        };
        let producers = ProducersCoordinator::new(settings.clone());
        let consumers = ConsumersCoordinator::new(
            CoordinatorSettings {
                max_by_connection: config.max_consumers_by_connection,
                ..settings
            },
            codec.clone(),
        );
        let committing = OffsetCommittingCoordinator::new(scheduler);

        info!(
            client = %config.client_name,
            addresses = ?config.addresses,
            codec = codec.name(),
            "Stream environment connected"
        );

        Ok(Environment {
            config,
            codec,
            metrics,
            locator,
            producers,
            consumers,
            committing,
            producer_handles: Mutex::new(Vec::new()),
            consumer_handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }
}

/// Connected client
pub struct Environment {
    config: EnvironmentConfig,
    codec: Arc<dyn Codec>,
    metrics: Arc<dyn MetricsCollector>,
    locator: Locator,
    producers: ProducersCoordinator,
    consumers: ConsumersCoordinator,
    committing: OffsetCommittingCoordinator,
    producer_handles: Mutex<Vec<Producer>>,
    consumer_handles: Mutex<Vec<Consumer>>,
    closed: AtomicBool,
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// Shorthand for a builder with `config` and `transport`
    pub async fn connect(config: EnvironmentConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder()
            .config(config)
            .transport(transport)
            .connect()
            .await
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsCollector> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::closed("environment"));
        }
        Ok(())
    }

    pub async fn create_producer(&self, stream: &str) -> Result<Producer> {
        self.ensure_open()?;
        let registration = self.producers.register(stream).await?;
        let producer = Producer::new(registration, self.codec.clone());

        let mut handles = self.producer_handles.lock();
        handles.retain(|handle| !handle.is_closed());
        handles.push(producer.clone());
        Ok(producer)
    }

    pub async fn create_consumer<H>(&self, options: ConsumerOptions, handler: H) -> Result<Consumer>
    where
        H: Fn(&MessageContext<'_>, Message) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let handler: MessageHandler = Arc::new(handler);
        let consumer = Consumer::subscribe(
            &self.consumers,
            &self.committing,
            options,
            &self.config.default_commit,
            handler,
        )
        .await?;

        let mut handles = self.consumer_handles.lock();
        handles.retain(|handle| !handle.is_closed());
        handles.push(consumer.clone());
        Ok(consumer)
    }

    pub async fn create_stream(&self, stream: &str) -> Result<()> {
        self.ensure_open()?;
        self.locator.create_stream(stream).await
    }

    pub async fn delete_stream(&self, stream: &str) -> Result<()> {
        self.ensure_open()?;
        self.locator.delete_stream(stream).await
    }

    /// Stored offset of `reference` on `stream`, if any
    pub async fn query_offset(&self, reference: &str, stream: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        self.locator.query_offset(reference, stream).await
    }

    pub fn producer_connection_count(&self) -> usize {
        self.producers.connection_count()
    }

    pub fn consumer_connection_count(&self) -> usize {
        self.consumers.connection_count()
    }

    pub fn locator_available(&self) -> bool {
        self.locator.is_available()
    }

    /// Close producers, consumers, coordinators and the locator, in that
    /// order. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(client = %self.config.client_name, "Closing stream environment");

        let producers = std::mem::take(&mut *self.producer_handles.lock());
        for producer in producers {
            producer.close().await;
        }
        let consumers = std::mem::take(&mut *self.consumer_handles.lock());
        for consumer in consumers {
            consumer.close().await;
        }

        self.producers.close().await;
        self.consumers.close().await;
        self.committing.close().await;
        self.locator.close().await;
        debug!("Stream environment closed");
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("client_name", &self.config.client_name)
            .field("locator", &self.locator)
            .field("closed", &self.is_closed())
            .finish()
    }
}
