//! Consumer handle and options

use crate::config::CommitConfiguration;
use crate::consumers::{
    ConsumersCoordinator, MessageContext, MessageHandler, SubscriptionRegistration,
    WeakSubscription,
};
use crate::lifecycle::EntityState;
use crate::offset_committing::{CommitRegistration, Committer, OffsetCommittingCoordinator};
use async_trait::async_trait;
use codec::Message;
use network::{OffsetSpecification, Result, TransportError};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

/// What a consumer reads and how it tracks progress
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    pub stream: String,
    pub offset: OffsetSpecification,
    /// Name under which offsets are stored; enables resume and commits
    pub reference: Option<String>,
    /// Overrides the environment's default commit configuration
    pub commit: Option<CommitConfiguration>,
}

impl ConsumerOptions {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            offset: OffsetSpecification::default(),
            reference: None,
            commit: None,
        }
    }

    pub fn offset(mut self, offset: OffsetSpecification) -> Self {
        self.offset = offset;
        self
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn commit(mut self, commit: CommitConfiguration) -> Self {
        self.commit = Some(commit);
        self
    }

    /// Offsets are only stored through [`Consumer::store_offset`]
    pub fn manual_commit(self) -> Self {
        self.commit(CommitConfiguration::disabled())
    }
}

/// Stores offsets through the subscription once it exists
struct SubscriptionCommitter {
    description: String,
    subscription: OnceLock<WeakSubscription>,
}

#[async_trait]
impl Committer for SubscriptionCommitter {
    async fn store_offset(&self, offset: u64) -> Result<()> {
        match self.subscription.get() {
            Some(subscription) => subscription.store_offset(offset).await,
            None => Err(TransportError::unavailable(self.description.clone())),
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

struct ConsumerInner {
    subscription: SubscriptionRegistration,
    commit: Option<CommitRegistration>,
}

/// Receives messages from one stream
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub(crate) async fn subscribe(
        consumers: &ConsumersCoordinator,
        committing: &OffsetCommittingCoordinator,
        options: ConsumerOptions,
        default_commit: &CommitConfiguration,
        handler: MessageHandler,
    ) -> Result<Self> {
        let commit_config = options
            .commit
            .clone()
            .unwrap_or_else(|| default_commit.clone());

        let commit = if OffsetCommittingCoordinator::needs_commit_registration(
            options.reference.as_deref(),
            &commit_config,
        ) {
            let committer = Arc::new(SubscriptionCommitter {
                description: format!(
                    "consumer '{}' on stream '{}'",
                    options.reference.as_deref().unwrap_or_default(),
                    options.stream
                ),
                subscription: OnceLock::new(),
            });
            let registration = committing.register(committer.clone(), commit_config)?;
            Some((committer, registration))
        } else {
            None
        };

        let handler: MessageHandler = match &commit {
            Some((_, registration)) => {
                let registration = registration.clone();
                Arc::new(move |context: &MessageContext<'_>, message: Message| {
                    handler(context, message);
                    registration.message_processed(context.offset());
                })
            }
            None => handler,
        };

        let subscription = match consumers
            .subscribe(&options.stream, options.offset, options.reference.clone(), handler)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Some((_, registration)) = &commit {
                    registration.close().await;
                }
                return Err(e);
            }
        };

        let commit = commit.map(|(committer, registration)| {
            let _ = committer.subscription.set(subscription.downgrade());
            close_when_terminal(
                committing.scheduler(),
                subscription.watch_state(),
                registration.clone(),
            );
            registration
        });

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                subscription,
                commit,
            }),
        })
    }

    pub fn stream(&self) -> &str {
        self.inner.subscription.stream()
    }

    pub fn reference(&self) -> Option<&str> {
        self.inner.subscription.reference()
    }

    /// Offset of the last message handed to the handler
    pub fn last_delivered_offset(&self) -> Option<u64> {
        self.inner.subscription.last_delivered_offset()
    }

    /// Last offset acknowledged by automatic commits
    pub fn committed_offset(&self) -> Option<u64> {
        self.inner
            .commit
            .as_ref()
            .and_then(|commit| commit.committed_offset())
    }

    /// Store `offset` for this consumer's reference
    ///
    /// With automatic commit the offset goes through the commit
    /// registration, so it never races a running commit.
    pub async fn store_offset(&self, offset: u64) -> Result<()> {
        match &self.inner.commit {
            Some(commit) => commit.commit_offset(offset).await,
            None => self.inner.subscription.store_offset(offset).await,
        }
    }

    pub fn state(&self) -> EntityState {
        self.inner.subscription.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<EntityState> {
        self.inner.subscription.watch_state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.subscription.is_closed()
    }

    /// Flush pending commits, then unsubscribe. Idempotent.
    pub async fn close(&self) {
        if let Some(commit) = &self.inner.commit {
            commit.close().await;
        }
        self.inner.subscription.close().await;
    }
}

/// Stop committing once the subscription is closed or has failed for good
fn close_when_terminal(
    scheduler: &Handle,
    mut state: watch::Receiver<EntityState>,
    registration: CommitRegistration,
) {
    scheduler.spawn(async move {
        loop {
            if state.borrow_and_update().is_terminal() {
                break;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
        if !registration.is_closed() {
            debug!(registration = ?registration, "Subscription ended, closing commit registration");
            registration.close().await;
        }
    });
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("subscription", &self.inner.subscription)
            .field("commit", &self.inner.commit)
            .finish()
    }
}
