//! Offset-Committing Coordinator
//!
//! Batches consumer progress and checkpoints it through a [`Committer`].
//! A commit is triggered when the processed-message count reaches the
//! configured threshold or when the flush timer fires with progress pending.
//! At most one commit runs per registration; a trigger that arrives while
//! one is in flight is coalesced into a single follow-up commit.

use crate::config::CommitConfiguration;
use async_trait::async_trait;
use network::{Result, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Destination of committed offsets
#[async_trait]
pub trait Committer: Send + Sync {
    /// Persist `offset` as the last processed offset
    async fn store_offset(&self, offset: u64) -> Result<()>;

    /// Name used in logs
    fn description(&self) -> String;
}

#[derive(Debug, Default)]
struct CommitState {
    /// Messages processed since the last successful commit was issued
    accumulated: u64,
    last_seen: Option<u64>,
    last_committed: Option<u64>,
    in_flight: bool,
    pending: bool,
    closed: bool,
}

impl CommitState {
    fn has_progress(&self) -> bool {
        self.last_seen > self.last_committed
    }

    /// Claim the commit slot for the current progress
    fn begin(&mut self) -> Option<(u64, u64)> {
        if self.in_flight || !self.has_progress() {
            return None;
        }
        let offset = self.last_seen?;
        self.in_flight = true;
        Some((offset, std::mem::take(&mut self.accumulated)))
    }
}

struct RegistrationInner {
    id: u64,
    committer: Arc<dyn Committer>,
    config: CommitConfiguration,
    scheduler: Handle,
    state: Mutex<CommitState>,
    idle: Notify,
    timer: Mutex<Option<JoinHandle<()>>>,
    coordinator: Weak<CoordinatorInner>,
}

impl RegistrationInner {
    fn message_processed(self: &Arc<Self>, offset: u64) {
        let threshold_reached = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.last_seen = state.last_seen.max(Some(offset));
            state.accumulated += 1;
            self.config.message_count_before_commit > 0
                && state.accumulated >= self.config.message_count_before_commit
        };
        if threshold_reached {
            self.trigger();
        }
    }

    /// Start a background commit, or coalesce with the running one
    fn trigger(self: &Arc<Self>) {
        let claimed = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.in_flight {
                state.pending = true;
                return;
            }
            state.begin()
        };

        if let Some((offset, count)) = claimed {
            let registration = self.clone();
            self.scheduler.spawn(async move {
                let result = registration.committer.store_offset(offset).await;
                if registration.complete(offset, count, &result) {
                    registration.trigger();
                }
            });
        }
    }

    /// Record the outcome of a commit; true when a coalesced trigger is due
    fn complete(&self, offset: u64, count: u64, result: &Result<()>) -> bool {
        let retrigger = {
            let mut state = self.state.lock();
            match result {
                Ok(()) => {
                    state.last_committed = state.last_committed.max(Some(offset));
                }
                Err(e) => {
                    state.accumulated += count;
                    warn!(
                        committer = %self.committer.description(),
                        offset,
                        error = %e,
                        "Offset commit failed"
                    );
                }
            }
            state.in_flight = false;
            std::mem::take(&mut state.pending) && !state.closed
        };
        if result.is_ok() {
            debug!(committer = %self.committer.description(), offset, "Offset committed");
        }
        self.idle.notify_waiters();
        retrigger
    }

    /// Wait for the in-flight commit, then commit whatever is left
    async fn flush(self: &Arc<Self>) -> Result<()> {
        let claimed = loop {
            let idle = self.idle.notified();
            {
                let mut state = self.state.lock();
                if !state.in_flight {
                    break state.begin();
                }
            }
            idle.await;
        };

        let Some((offset, count)) = claimed else {
            return Ok(());
        };
        let result = self.committer.store_offset(offset).await;
        if self.complete(offset, count, &result) {
            self.trigger();
        }
        result
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if !self.state.lock().in_flight {
                return;
            }
            idle.await;
        }
    }

    fn start_timer(self: &Arc<Self>) {
        let interval = self.config.flush_interval;
        if !self.config.auto_commit || interval.is_zero() {
            return;
        }

        let registration = Arc::downgrade(self);
        let timer = self.scheduler.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registration) = registration.upgrade() else {
                    break;
                };
                let due = registration.state.lock().accumulated > 0;
                if due {
                    registration.trigger();
                }
            }
        });
        *self.timer.lock() = Some(timer);
    }

    async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending = false;
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }

        if let Err(e) = self.flush().await {
            warn!(committer = %self.committer.description(), error = %e, "Final offset commit failed");
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.registrations.lock().remove(&self.id);
        }
    }
}

/// Commit hooks for one consumer
#[derive(Clone)]
pub struct CommitRegistration {
    inner: Arc<RegistrationInner>,
}

impl CommitRegistration {
    /// Call once per message the handler finished processing
    pub fn message_processed(&self, offset: u64) {
        self.inner.message_processed(offset);
    }

    /// Commit the progress recorded so far, waiting for any running commit
    pub async fn commit(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Record `offset` as processed and commit it
    pub async fn commit_offset(&self, offset: u64) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TransportError::closed(self.inner.committer.description()));
            }
            state.last_seen = state.last_seen.max(Some(offset));
        }
        self.inner.flush().await
    }

    /// Highest offset acknowledged by the committer
    pub fn committed_offset(&self) -> Option<u64> {
        self.inner.state.lock().last_committed
    }

    /// Messages processed since the last commit was issued
    pub fn accumulated(&self) -> u64 {
        self.inner.state.lock().accumulated
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Wait until no commit is running
    pub async fn wait_idle(&self) {
        self.inner.wait_idle().await
    }

    /// Stop the flush timer and commit the remaining progress. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl std::fmt::Debug for CommitRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CommitRegistration")
            .field("id", &self.inner.id)
            .field("committer", &self.inner.committer.description())
            .field("last_seen", &state.last_seen)
            .field("last_committed", &state.last_committed)
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

struct CoordinatorInner {
    scheduler: Handle,
    registrations: Mutex<HashMap<u64, Arc<RegistrationInner>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

pub struct OffsetCommittingCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl OffsetCommittingCoordinator {
    pub fn new(scheduler: Handle) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                scheduler,
                registrations: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Only consumers with a reference and automatic commit need tracking
    pub fn needs_commit_registration(reference: Option<&str>, config: &CommitConfiguration) -> bool {
        reference.is_some_and(|reference| !reference.is_empty()) && config.auto_commit
    }

    pub fn register(
        &self,
        committer: Arc<dyn Committer>,
        config: CommitConfiguration,
    ) -> Result<CommitRegistration> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("offset committing coordinator"));
        }
        if config.auto_commit && config.message_count_before_commit == 0 && config.flush_interval.is_zero() {
            return Err(TransportError::configuration(
                "automatic commit needs a message count or a flush interval",
                Some("commit"),
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(RegistrationInner {
            id,
            committer,
            config,
            scheduler: self.inner.scheduler.clone(),
            state: Mutex::new(CommitState::default()),
            idle: Notify::new(),
            timer: Mutex::new(None),
            coordinator: Arc::downgrade(&self.inner),
        });
        registration.start_timer();
        self.inner.registrations.lock().insert(id, registration.clone());
        debug!(registration = id, committer = %registration.committer.description(), "Commit registration added");

        Ok(CommitRegistration { inner: registration })
    }

    pub(crate) fn scheduler(&self) -> &Handle {
        &self.inner.scheduler
    }

    pub fn registration_count(&self) -> usize {
        self.inner.registrations.lock().len()
    }

    /// Flush and close every registration. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let registrations: Vec<_> = self
            .inner
            .registrations
            .lock()
            .values()
            .cloned()
            .collect();
        for registration in registrations {
            registration.close().await;
        }
        debug!("Offset committing coordinator closed");
    }
}
