//! Producer handle returned by [`crate::Environment::create_producer`]

use crate::lifecycle::EntityState;
use crate::producers::ProducerRegistration;
use codec::{Codec, Message};
use network::{Result, TransportError};
use std::sync::Arc;
use tokio::sync::watch;

struct ProducerInner {
    registration: ProducerRegistration,
    codec: Arc<dyn Codec>,
}

/// Publishes messages to one stream
///
/// Cloning is cheap; all clones share the same registration.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    pub(crate) fn new(registration: ProducerRegistration, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                registration,
                codec,
            }),
        }
    }

    pub fn stream(&self) -> &str {
        self.inner.registration.stream()
    }

    /// Encode and publish one message; returns its publishing id
    ///
    /// Fails with `Unavailable` while the producer is recovering.
    pub async fn send(&self, message: &Message) -> Result<u64> {
        let encoded = self.inner.codec.encode(message)?;
        let ids = self.inner.registration.publish(vec![encoded]).await?;
        ids.first().copied().ok_or_else(|| {
            TransportError::connection("publish returned no publishing id", None)
        })
    }

    /// Encode and publish a batch in one call
    pub async fn send_batch(&self, messages: &[Message]) -> Result<Vec<u64>> {
        let encoded = messages
            .iter()
            .map(|message| self.inner.codec.encode(message))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.inner.registration.publish(encoded).await
    }

    /// Published but not yet confirmed or rejected
    pub fn unconfirmed_count(&self) -> u64 {
        self.inner.registration.unconfirmed()
    }

    pub async fn wait_confirmed(&self) {
        self.inner.registration.wait_confirmed().await
    }

    pub fn state(&self) -> EntityState {
        self.inner.registration.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<EntityState> {
        self.inner.registration.watch_state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.registration.is_closed()
    }

    pub async fn close(&self) {
        self.inner.registration.close().await
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Producer")
            .field(&self.inner.registration)
            .finish()
    }
}
