//! Pooled connection entity
//!
//! While a connection is idle the registry owns its transport. Checking it
//! out moves the transport into a `PooledConnection` handle, so exactly one
//! caller can hold a given connection until it is put back or closed.

use async_trait::async_trait;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique identifier of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw transport the pool can close
#[async_trait]
pub trait Transport: Send + 'static {
    /// Close the transport with a normal-closure code and a reason text
    async fn close(&mut self, reason: &str);
}

/// Lifecycle metadata of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub created_at: Instant,
    pub last_used: Instant,
    pub in_use: bool,
}

impl ConnectionInfo {
    pub(crate) fn new(id: ConnectionId, now: Instant) -> Self {
        Self {
            id,
            created_at: now,
            last_used: now,
            in_use: true,
        }
    }

    /// Older than the maximum lifetime, in use or not
    pub fn is_expired(&self, max_lifetime: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > max_lifetime
    }

    /// Idle for longer than the idle timeout
    pub fn is_idle(&self, idle_timeout: Duration, now: Instant) -> bool {
        !self.in_use && now.saturating_duration_since(self.last_used) > idle_timeout
    }

    pub(crate) fn mark_used(&mut self, now: Instant) {
        self.in_use = true;
        self.last_used = now;
    }

    pub(crate) fn mark_idle(&mut self, now: Instant) {
        self.in_use = false;
        self.last_used = now;
    }
}

/// Reclaims the registry slot of a handle dropped without `put` or `close`
pub(crate) trait SlotRelease: Send + Sync {
    fn release_dropped(&self, id: ConnectionId);
}

struct DropGuard {
    id: ConnectionId,
    owner: Option<Weak<dyn SlotRelease>>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take().and_then(|owner| owner.upgrade()) {
            owner.release_dropped(self.id);
        }
    }
}

/// A connection checked out of the pool.
///
/// Hand it back with `put` or `close`. A handle that is simply dropped (a
/// panic, an early return) frees its pool slot and wakes one waiter, but the
/// transport is dropped without a close frame.
pub struct PooledConnection<C> {
    created_at: Instant,
    conn: C,
    guard: DropGuard,
}

impl<C> PooledConnection<C> {
    pub(crate) fn new(id: ConnectionId, created_at: Instant, conn: C) -> Self {
        Self {
            created_at,
            conn,
            guard: DropGuard { id, owner: None },
        }
    }

    /// Tie the handle to the pool that must hear about its drop
    pub(crate) fn owned_by(mut self, owner: Weak<dyn SlotRelease>) -> Self {
        self.guard.owner = Some(owner);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub(crate) fn into_inner(self) -> C {
        let Self { conn, mut guard, .. } = self;
        guard.owner = None;
        conn
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.guard.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_rules() {
        let mut info = ConnectionInfo::new(ConnectionId::new(), Instant::now());
        let idle = Duration::from_secs(5);
        let lifetime = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(10)).await;
        let now = Instant::now();
        // in use: never idle, only lifetime applies
        assert!(!info.is_idle(idle, now));
        assert!(!info.is_expired(lifetime, now));

        info.mark_idle(now);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(info.is_idle(idle, Instant::now()));

        info.mark_used(Instant::now());
        tokio::time::advance(Duration::from_secs(60)).await;
        let now = Instant::now();
        assert!(!info.is_idle(idle, now));
        assert!(info.is_expired(lifetime, now));
    }

    struct Recorder(std::sync::Mutex<Vec<ConnectionId>>);

    impl SlotRelease for Recorder {
        fn release_dropped(&self, id: ConnectionId) {
            self.0.lock().unwrap().push(id);
        }
    }

    #[tokio::test]
    async fn test_only_dropped_handles_are_reported() {
        let recorder = std::sync::Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let owner = std::sync::Arc::downgrade(&recorder) as Weak<dyn SlotRelease>;

        let dropped = PooledConnection::new(ConnectionId::new(), Instant::now(), ())
            .owned_by(owner.clone());
        let dropped_id = dropped.id();
        drop(dropped);

        let returned = PooledConnection::new(ConnectionId::new(), Instant::now(), ())
            .owned_by(owner);
        returned.into_inner();

        assert_eq!(*recorder.0.lock().unwrap(), vec![dropped_id]);
    }
}
