//! Entity Lifecycle
//!
//! Producers and subscriptions share the same attachment state machine:
//!
//! ```text
//!            bind                 connection lost
//! Unavailable ────► Attached ────────────────► Unavailable (recovering)
//!      │                │                           │
//!      └── close/fail ──┴──────── close/fail ───────┴──► Closed
//! ```
//!
//! The binding sits behind a single-writer lock and is never read as a bare
//! nullable reference: callers get the current attachment or an explicit
//! `Unavailable` / `Closed` error. Observers follow the state through a
//! `watch` channel.

use crate::managed_connection::ManagedConnection;
use crate::pool::Attachment;
use network::{RetryCanceller, Result, TransportError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;

/// Externally visible state of a producer or consumer
#[derive(Debug, Clone)]
pub enum EntityState {
    Running,
    /// Connection lost; recovery in progress
    Recovering,
    Closed,
    /// Recovery gave up; terminal
    Failed(TransportError),
}

impl EntityState {
    pub fn is_running(&self) -> bool {
        matches!(self, EntityState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntityState::Closed | EntityState::Failed(_))
    }
}

enum Binding<T> {
    Attached {
        connection: Arc<ManagedConnection<T>>,
        slot: u8,
    },
    Unavailable,
    Closed,
}

/// Result of trying to bind a fresh attachment
pub(crate) enum BindOutcome {
    Bound,
    /// Entity closed meanwhile; release the attachment
    Closed,
    /// Connection died before the bind; try again
    Dead,
}

pub(crate) struct Lifecycle<T> {
    label: String,
    binding: RwLock<Binding<T>>,
    state: watch::Sender<EntityState>,
    recovery: Mutex<Option<RetryCanceller>>,
}

impl<T: Clone> Lifecycle<T> {
    pub fn new(label: String) -> Self {
        let (state, _) = watch::channel(EntityState::Running);
        Self {
            label,
            binding: RwLock::new(Binding::Unavailable),
            state,
            recovery: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current connection and connection-local id
    pub fn current(&self) -> Result<(Arc<ManagedConnection<T>>, u8)> {
        match &*self.binding.read() {
            Binding::Attached { connection, slot } => Ok((connection.clone(), *slot)),
            Binding::Unavailable => Err(TransportError::unavailable(self.label.clone())),
            Binding::Closed => Err(TransportError::closed(self.label.clone())),
        }
    }

    /// Id of the connection currently carrying the entity
    pub fn connection_id(&self) -> Option<u64> {
        match &*self.binding.read() {
            Binding::Attached { connection, .. } => Some(connection.id()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.binding.read(), Binding::Closed)
    }

    pub fn bind(&self, attachment: &Attachment<T>) -> BindOutcome {
        let mut binding = self.binding.write();
        if matches!(*binding, Binding::Closed) {
            return BindOutcome::Closed;
        }
        if attachment.connection.is_dead() {
            return BindOutcome::Dead;
        }
        *binding = Binding::Attached {
            connection: attachment.connection.clone(),
            slot: attachment.slot,
        };
        self.recovery.lock().take();
        self.state.send_replace(EntityState::Running);
        BindOutcome::Bound
    }

    /// Move to recovering if currently attached to `connection_id`
    pub fn connection_lost(&self, connection_id: u64) -> bool {
        let mut binding = self.binding.write();
        let attached = matches!(
            &*binding,
            Binding::Attached { connection, .. } if connection.id() == connection_id
        );
        if attached {
            *binding = Binding::Unavailable;
            self.state.send_replace(EntityState::Recovering);
        }
        attached
    }

    pub fn set_recovery(&self, canceller: RetryCanceller) {
        *self.recovery.lock() = Some(canceller);
    }

    /// Close; returns the attachment to release, or `None` if already closed
    pub fn close(&self) -> Option<Option<(Arc<ManagedConnection<T>>, u8)>> {
        self.terminate(EntityState::Closed)
    }

    /// Recovery gave up
    pub fn fail(&self, error: TransportError) -> Option<Option<(Arc<ManagedConnection<T>>, u8)>> {
        self.terminate(EntityState::Failed(error))
    }

    fn terminate(
        &self,
        final_state: EntityState,
    ) -> Option<Option<(Arc<ManagedConnection<T>>, u8)>> {
        let previous = {
            let mut binding = self.binding.write();
            if matches!(*binding, Binding::Closed) {
                return None;
            }
            std::mem::replace(&mut *binding, Binding::Closed)
        };

        if let Some(recovery) = self.recovery.lock().take() {
            recovery.cancel();
        }
        self.state.send_replace(final_state);

        match previous {
            Binding::Attached { connection, slot } => Some(Some((connection, slot))),
            _ => Some(None),
        }
    }

    pub fn state(&self) -> EntityState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EntityState> {
        self.state.subscribe()
    }
}
