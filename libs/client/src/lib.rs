//! # Stream Client
//!
//! ## Purpose
//!
//! Client runtime for a replicated append-only stream broker. Many logical
//! producers and consumers share a small number of broker connections and
//! are transparently moved to a healthy connection when one fails.
//!
//! ## Architecture Role
//!
//! ```text
//! Environment ─┬─ Locator ───────────────── topology + admin connection
//!              ├─ ProducersCoordinator ──── ManagedConnection[producer ids]
//!              ├─ ConsumersCoordinator ──── ManagedConnection[subscription ids]
//!              └─ OffsetCommittingCoordinator (wraps consumer handlers)
//! ```
//!
//! Recovery of every entity runs through [`network::recovery::async_retry`]
//! with the configured backoff policies. Entity state is observable through
//! `watch` channels of [`EntityState`].

pub mod config;
pub mod consumer;
pub mod consumers;
pub mod environment;
pub mod lifecycle;
pub mod locator;
pub mod managed_connection;
pub mod offset_committing;
mod pool;
pub mod producer;
pub mod producers;

pub use config::{BackoffConfig, CommitConfiguration, EnvironmentConfig};
pub use consumer::{Consumer, ConsumerOptions};
pub use consumers::{ConsumersCoordinator, MessageContext, MessageHandler, SubscriptionRegistration};
pub use environment::{Environment, EnvironmentBuilder};
pub use lifecycle::EntityState;
pub use locator::Locator;
pub use managed_connection::ManagedConnection;
pub use offset_committing::{CommitRegistration, Committer, OffsetCommittingCoordinator};
pub use producer::Producer;
pub use producers::{CoordinatorSettings, ProducerRegistration, ProducersCoordinator};

pub use codec::{BinaryCodec, Codec, Message, MessageId, Properties};
pub use network::{OffsetSpecification, Result, TransportError};
