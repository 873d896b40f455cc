//! Managed Connections
//!
//! A [`ManagedConnection`] wraps one transport connection shared by many
//! producers or subscriptions. Each attached entity gets a one-byte
//! connection-local id, lowest free id first. The slot table is only written
//! under its lock; the load counter mirrors the table size so placement can
//! read it without locking.

use network::{Address, Connection};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Transport connection plus the entities multiplexed onto it
pub struct ManagedConnection<T> {
    id: u64,
    address: Address,
    connection: Arc<dyn Connection>,
    capacity: usize,
    slots: Mutex<BTreeMap<u8, T>>,
    load: AtomicUsize,
    dead: AtomicBool,
}

impl<T: Clone> ManagedConnection<T> {
    /// `capacity` is clamped to the 256 available one-byte ids
    pub fn new(id: u64, address: Address, connection: Arc<dyn Connection>, capacity: usize) -> Self {
        Self {
            id,
            address,
            connection,
            capacity: capacity.clamp(1, u8::MAX as usize + 1),
            slots: Mutex::new(BTreeMap::new()),
            load: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Best-effort read for placement decisions
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Stop accepting attachments. Returns true for the first caller only.
    pub fn mark_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }

    pub fn has_capacity(&self) -> bool {
        !self.is_dead() && self.load() < self.capacity
    }

    /// Attach an entity under the lowest free id
    pub fn attach(&self, entity: T) -> Option<u8> {
        let mut slots = self.slots.lock();
        if self.is_dead() || slots.len() >= self.capacity {
            return None;
        }

        let slot = (0..self.capacity)
            .map(|candidate| candidate as u8)
            .find(|candidate| !slots.contains_key(candidate))?;
        slots.insert(slot, entity);
        self.load.store(slots.len(), Ordering::Release);
        Some(slot)
    }

    /// Release an id; `None` if it was not attached
    pub fn detach(&self, slot: u8) -> Option<T> {
        let mut slots = self.slots.lock();
        let entity = slots.remove(&slot);
        self.load.store(slots.len(), Ordering::Release);
        entity
    }

    /// Detach `slot`; the connection stops accepting attachments when that
    /// leaves it empty. The flag is true for the caller that must close it.
    pub fn release(&self, slot: u8) -> (Option<T>, bool) {
        let mut slots = self.slots.lock();
        let entity = slots.remove(&slot);
        self.load.store(slots.len(), Ordering::Release);
        let idle = slots.is_empty() && self.mark_dead();
        (entity, idle)
    }

    pub fn get(&self, slot: u8) -> Option<T> {
        self.slots.lock().get(&slot).cloned()
    }

    /// Snapshot of the attached entities
    pub fn entries(&self) -> Vec<(u8, T)> {
        self.slots
            .lock()
            .iter()
            .map(|(slot, entity)| (*slot, entity.clone()))
            .collect()
    }

    /// Mark dead and take every attached entity
    pub fn drain(&self) -> Vec<(u8, T)> {
        let mut slots = self.slots.lock();
        self.dead.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *slots);
        self.load.store(0, Ordering::Release);
        drained.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.load() == 0
    }
}

impl<T> fmt::Debug for ManagedConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("capacity", &self.capacity)
            .field("load", &self.load.load(Ordering::Relaxed))
            .field("dead", &self.dead.load(Ordering::Relaxed))
            .finish()
    }
}
