//! Pool registry
//!
//! Synchronized set of pooled connections, kept in registration order so
//! idle lookups are deterministic. One mutex guards the whole set and is
//! never held across an await.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

use super::connection::{ConnectionId, ConnectionInfo, PooledConnection};
use crate::types::{GatewayError, Result};

/// A registered connection: metadata plus the transport while it is idle
struct Slot<C> {
    info: ConnectionInfo,
    conn: Option<C>,
}

/// Thread-safe registry of pooled connections
pub struct PoolRegistry<C> {
    slots: Mutex<Vec<Slot<C>>>,
    max_size: usize,
}

impl<C> PoolRegistry<C> {
    pub fn new(max_size: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot<C>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection as in use by its creator.
    ///
    /// Returns `false` without registering when the registry is full.
    pub fn add(&self, id: ConnectionId, now: Instant) -> bool {
        let mut slots = self.lock();
        if slots.len() >= self.max_size {
            return false;
        }
        slots.push(Slot {
            info: ConnectionInfo::new(id, now),
            conn: None,
        });
        true
    }

    /// Unregister a connection, returning its transport if it was idle
    pub fn remove(&self, id: ConnectionId) -> Result<Option<C>> {
        let mut slots = self.lock();
        match slots.iter().position(|slot| slot.info.id == id) {
            Some(index) => Ok(slots.remove(index).conn),
            None => Err(GatewayError::NotFound(format!("connection {} is not registered", id))),
        }
    }

    /// Check out the first idle connection in registration order
    pub fn find_available(&self, now: Instant) -> Option<PooledConnection<C>> {
        let mut slots = self.lock();
        let slot = slots
            .iter_mut()
            .find(|slot| !slot.info.in_use && slot.conn.is_some())?;
        let conn = slot.conn.take()?;
        slot.info.mark_used(now);
        Some(PooledConnection::new(slot.info.id, slot.info.created_at, conn))
    }

    /// Return a checked-out connection to the idle set.
    ///
    /// Hands the connection back if its id is no longer registered.
    pub fn check_in(
        &self,
        conn: PooledConnection<C>,
        now: Instant,
    ) -> std::result::Result<(), PooledConnection<C>> {
        let mut slots = self.lock();
        match slots.iter_mut().find(|slot| slot.info.id == conn.id()) {
            Some(slot) => {
                slot.info.mark_idle(now);
                slot.conn = Some(conn.into_inner());
                Ok(())
            }
            None => Err(conn),
        }
    }

    /// Refresh a checked-out connection that changes hands without going idle
    pub fn mark_used(&self, id: ConnectionId, now: Instant) -> bool {
        let mut slots = self.lock();
        match slots.iter_mut().find(|slot| slot.info.id == id) {
            Some(slot) => {
                slot.info.mark_used(now);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().iter().any(|slot| slot.info.id == id)
    }

    /// Remove every connection matching the predicate
    pub fn remove_where<P>(&self, predicate: P) -> Vec<(ConnectionInfo, Option<C>)>
    where
        P: Fn(&ConnectionInfo) -> bool,
    {
        let mut slots = self.lock();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(slots.len());
        for slot in slots.drain(..) {
            if predicate(&slot.info) {
                removed.push((slot.info, slot.conn));
            } else {
                kept.push(slot);
            }
        }
        *slots = kept;
        removed
    }

    /// Remove everything
    pub fn drain(&self) -> Vec<(ConnectionInfo, Option<C>)> {
        self.lock()
            .drain(..)
            .map(|slot| (slot.info, slot.conn))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.max_size
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Metadata of every registered connection, in registration order
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().iter().map(|slot| slot.info).collect()
    }

    /// (total, in use) counted under one lock
    pub fn usage(&self) -> (usize, usize) {
        let slots = self.lock();
        let active = slots.iter().filter(|slot| slot.info.in_use).count();
        (slots.len(), active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[ConnectionId]) -> PoolRegistry<&'static str> {
        let registry = PoolRegistry::new(ids.len());
        let now = Instant::now();
        for id in ids {
            assert!(registry.add(*id, now));
            let conn = PooledConnection::new(*id, now, "transport");
            assert!(registry.check_in(conn, now).is_ok());
        }
        registry
    }

    #[tokio::test]
    async fn test_add_respects_capacity() {
        let registry: PoolRegistry<()> = PoolRegistry::new(2);
        let now = Instant::now();
        assert!(registry.add(ConnectionId::new(), now));
        assert!(!registry.is_full());
        assert!(registry.add(ConnectionId::new(), now));
        assert!(registry.is_full());
        assert!(!registry.add(ConnectionId::new(), now));
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn test_find_available_in_registration_order() {
        let ids = [ConnectionId::new(), ConnectionId::new(), ConnectionId::new()];
        let registry = registry_with(&ids);
        let now = Instant::now();

        let first = registry.find_available(now).unwrap();
        let second = registry.find_available(now).unwrap();
        assert_eq!(first.id(), ids[0]);
        assert_eq!(second.id(), ids[1]);
        assert_eq!(registry.usage(), (3, 2));

        // returning the first makes it the next candidate again
        registry.check_in(first, now).unwrap();
        assert_eq!(registry.find_available(now).unwrap().id(), ids[0]);
    }

    #[tokio::test]
    async fn test_find_available_skips_in_use() {
        let registry: PoolRegistry<()> = PoolRegistry::new(1);
        registry.add(ConnectionId::new(), Instant::now());
        assert!(registry.find_available(Instant::now()).is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_an_error() {
        let registry: PoolRegistry<()> = PoolRegistry::new(1);
        let err = registry.remove(ConnectionId::new()).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_returns_idle_transport() {
        let ids = [ConnectionId::new()];
        let registry = registry_with(&ids);
        assert_eq!(registry.remove(ids[0]).unwrap(), Some("transport"));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_check_in_of_unregistered_connection_is_refused() {
        let registry: PoolRegistry<&'static str> = PoolRegistry::new(1);
        let stray = PooledConnection::new(ConnectionId::new(), Instant::now(), "stray");
        let back = registry.check_in(stray, Instant::now()).unwrap_err();
        assert_eq!(*back.conn(), "stray");
    }

    #[tokio::test]
    async fn test_remove_where_keeps_order_of_survivors() {
        let ids = [ConnectionId::new(), ConnectionId::new(), ConnectionId::new()];
        let registry = registry_with(&ids);

        let removed = registry.remove_where(|info| info.id == ids[1]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0.id, ids[1]);

        let remaining: Vec<_> = registry.snapshot().iter().map(|info| info.id).collect();
        assert_eq!(remaining, vec![ids[0], ids[2]]);
    }
}
