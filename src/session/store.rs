//! Session store
//!
//! Tracks connected streaming clients by session id. Several sessions may
//! share one client id; their chunks land in the same batch buffer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::types::{GatewayError, Result};

/// Client id used when a connection does not identify itself
pub const UNKNOWN_CLIENT: &str = "unknown";

/// One connected client
#[derive(Debug, Clone, Serialize)]
pub struct ClientSession {
    pub session_id: Uuid,
    pub client_id: String,
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    started: Instant,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, peer_addr: Option<SocketAddr>) -> Self {
        let client_id = client_id.into();
        Self {
            session_id: Uuid::new_v4(),
            client_id: if client_id.is_empty() {
                UNKNOWN_CLIENT.to_string()
            } else {
                client_id
            },
            peer_addr,
            connected_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Time since the session was opened
    pub fn duration_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Thread-safe store of connected sessions, capped at `max_sessions`
pub struct SessionStore {
    sessions: DashMap<Uuid, ClientSession>,
    count: AtomicUsize,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::with_capacity(max_sessions),
            count: AtomicUsize::new(0),
            max_sessions,
        }
    }

    pub fn is_at_capacity(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= self.max_sessions
    }

    pub fn session_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Add a session, failing when the store is full
    pub fn insert(&self, session: ClientSession) -> Result<()> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .map_err(GatewayError::TooManyClients)?;

        debug!(
            "Session store: inserted {} for {}, count={}",
            session.session_id,
            session.client_id,
            self.count.load(Ordering::Relaxed)
        );
        self.sessions.insert(session.session_id, session);
        Ok(())
    }

    pub fn remove(&self, session_id: &Uuid) -> Option<ClientSession> {
        let (_, session) = self.sessions.remove(session_id)?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        debug!(
            "Session store: removed {}, count={}",
            session_id,
            self.count.load(Ordering::Relaxed)
        );
        Some(session)
    }

    pub fn get(&self, session_id: &Uuid) -> Option<ClientSession> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Number of open sessions for a client id
    pub fn sessions_for_client(&self, client_id: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.client_id == client_id)
            .count()
    }

    pub fn list(&self) -> Vec<ClientSession> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_capacity() {
        let store = SessionStore::new(2);
        assert!(!store.is_at_capacity());

        store.insert(ClientSession::new("c1", None)).unwrap();
        store.insert(ClientSession::new("c1", None)).unwrap();
        assert!(store.is_at_capacity());
        assert_eq!(store.sessions_for_client("c1"), 2);

        let err = store.insert(ClientSession::new("c2", None)).unwrap_err();
        assert!(matches!(err, GatewayError::TooManyClients(2)));
        assert_eq!(store.session_count(), 2);
    }

    #[test]
    fn test_remove_frees_slot() {
        let store = SessionStore::new(1);
        let session = ClientSession::new("c1", None);
        let id = session.session_id;
        store.insert(session).unwrap();

        assert_eq!(store.get(&id).unwrap().client_id, "c1");
        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
        assert_eq!(store.session_count(), 0);
        assert!(store.insert(ClientSession::new("c2", None)).is_ok());
    }

    #[test]
    fn test_empty_client_id_is_unknown() {
        let session = ClientSession::new("", None);
        assert_eq!(session.client_id, UNKNOWN_CLIENT);
    }
}
