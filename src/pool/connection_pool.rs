//! Bounded connection pool
//!
//! `get` reuses an idle connection, creates one while below capacity, or
//! parks the caller on a one-shot wait ticket. `put` hands a returned
//! connection straight to the oldest live ticket, so it never passes through
//! the idle set while someone is waiting for it.
//!
//! Lock order is always waiters then registry. Neither lock is held across
//! an await; transports are closed after both are released.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::config::PoolConfig;
use super::connection::{ConnectionId, PooledConnection, SlotRelease, Transport};
use super::factory::{ConnectionFactory, WebSocketFactory};
use super::registry::PoolRegistry;
use crate::shutdown::ShutdownListener;
use crate::types::{GatewayError, Result};

/// Maximum number of callers parked on wait tickets
pub const MAX_WAITERS: usize = 100;

/// How long `get` waits for a connection once the pool is at capacity
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a parked caller can be woken with
enum Handoff<C> {
    /// A connection, already marked in use for the receiver
    Connection(PooledConnection<C>),
    /// A slot was freed; retry acquisition
    Capacity,
}

impl<C> Handoff<C> {
    fn into_connection(self) -> Option<PooledConnection<C>> {
        match self {
            Self::Connection(conn) => Some(conn),
            Self::Capacity => None,
        }
    }
}

type Waiter<C> = oneshot::Sender<Handoff<C>>;

enum Acquire<'a, F: ConnectionFactory> {
    Ready(PooledConnection<F::Conn>),
    Create(Reservation<'a, F>),
    Wait(WaitTicket<'a, F>),
}

/// A registry slot claimed for a connection that is still being opened.
///
/// Dropped without `commit` (factory failure or an abandoned `get`), it
/// frees the slot and wakes one waiter.
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    id: ConnectionId,
    created_at: Instant,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<'_, F> {
    fn commit(mut self) -> (ConnectionId, Instant) {
        self.armed = false;
        (self.id, self.created_at)
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed && self.pool.slots.registry.remove(self.id).is_ok() {
            self.pool.slots.notify_capacity();
        }
    }
}

/// Receiving end of a parked `get`.
///
/// Whatever arrives after the caller stopped listening (timeout or a
/// dropped future) is passed on rather than lost.
struct WaitTicket<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    rx: oneshot::Receiver<Handoff<F::Conn>>,
}

impl<F: ConnectionFactory> Drop for WaitTicket<'_, F> {
    fn drop(&mut self) {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Handoff::Connection(conn)) => {
                if let Err((conn, err)) = self.pool.slots.place(conn) {
                    debug!("Closing connection {} orphaned by a waiter: {}", conn.id(), err);
                    let mut transport = conn.into_inner();
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            transport.close("pool shutting down").await;
                        });
                    }
                }
            }
            Ok(Handoff::Capacity) => self.pool.slots.notify_capacity(),
            Err(_) => {}
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Registered connections, in use or idle
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub capacity: usize,
    /// Callers currently parked on a wait ticket
    pub waiting: usize,
    pub created: u64,
    pub reused: u64,
    pub handed_off: u64,
    pub errors: u64,
}

/// Registry and wait queue, shared with checked-out handles so a dropped
/// handle can give its slot back
struct Slots<C> {
    registry: PoolRegistry<C>,
    waiters: Mutex<VecDeque<Waiter<C>>>,
    closed: AtomicBool,
}

impl<C: Transport> Slots<C> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_waiters(&self) -> MutexGuard<'_, VecDeque<Waiter<C>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a connection to the oldest live waiter, or return it to the
    /// idle set. Gives the connection back when it cannot be pooled.
    fn place(
        &self,
        conn: PooledConnection<C>,
    ) -> std::result::Result<(), (PooledConnection<C>, GatewayError)> {
        let mut waiters = self.lock_waiters();
        if self.is_closed() {
            return Err((conn, GatewayError::PoolClosed));
        }
        let id = conn.id();
        if !self.registry.contains(id) {
            return Err((conn, not_registered(id)));
        }

        let mut pending = Some(conn);
        while let Some(conn) = pending.take() {
            let Some(waiter) = waiters.pop_front() else {
                return self
                    .registry
                    .check_in(conn, Instant::now())
                    .map_err(|conn| (conn, not_registered(id)));
            };
            self.registry.mark_used(id, Instant::now());
            if let Err(returned) = waiter.send(Handoff::Connection(conn)) {
                pending = returned.into_connection();
            }
        }
        Ok(())
    }

    /// Wake one live waiter so it can retry after a slot was freed
    fn notify_capacity(&self) {
        let mut waiters = self.lock_waiters();
        while let Some(waiter) = waiters.pop_front() {
            if waiter.send(Handoff::Capacity).is_ok() {
                break;
            }
        }
    }
}

impl<C: Transport> SlotRelease for Slots<C> {
    fn release_dropped(&self, id: ConnectionId) {
        if self.registry.remove(id).is_ok() {
            warn!("Connection {} dropped without put or close, slot released", id);
            self.notify_capacity();
        }
    }
}

/// Bounded pool of reusable outbound connections
pub struct ConnectionPool<F: ConnectionFactory> {
    config: PoolConfig,
    factory: F,
    slots: Arc<Slots<F::Conn>>,
    wait_timeout: Duration,
    created: AtomicU64,
    reused: AtomicU64,
    handed_off: AtomicU64,
    errors: AtomicU64,
}

impl ConnectionPool<WebSocketFactory> {
    /// Pool of WebSocket connections to `config.server_url`
    pub fn websocket(config: PoolConfig) -> Result<Self> {
        if config.server_url.trim().is_empty() {
            return Err(GatewayError::Config(
                "connection pool needs a server URL".to_string(),
            ));
        }
        let config = config.validated();
        let factory = WebSocketFactory::new(config.connection_options());
        Ok(Self::new(config, factory))
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(config: PoolConfig, factory: F) -> Self {
        let config = config.validated();
        info!(
            "Connection pool ready: max {} connections to {}",
            config.max_pool_size, config.server_url
        );
        Self {
            slots: Arc::new(Slots {
                registry: PoolRegistry::new(config.max_pool_size),
                waiters: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
            config,
            factory,
            wait_timeout: WAIT_TIMEOUT,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            handed_off: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Override the wait timeout (tests and tooling)
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    fn owner(&self) -> Weak<dyn SlotRelease> {
        let slots: Weak<Slots<F::Conn>> = Arc::downgrade(&self.slots);
        slots
    }

    /// Check out a connection, waiting up to the pool's wait timeout when
    /// every slot is taken.
    pub async fn get(&self) -> Result<PooledConnection<F::Conn>> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            match self.acquire()? {
                Acquire::Ready(conn) => {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    debug!("Reusing pooled connection {}", conn.id());
                    return Ok(conn);
                }
                Acquire::Create(reservation) => return self.create(reservation).await,
                Acquire::Wait(ticket) => {
                    if let Some(conn) = self.wait_for_handoff(ticket, deadline).await? {
                        return Ok(conn);
                    }
                }
            }
        }
    }

    fn acquire(&self) -> Result<Acquire<'_, F>> {
        let mut waiters = self.slots.lock_waiters();
        if self.is_closed() {
            return Err(GatewayError::PoolClosed);
        }

        let now = Instant::now();
        if let Some(conn) = self.slots.registry.find_available(now) {
            return Ok(Acquire::Ready(conn.owned_by(self.owner())));
        }

        let id = ConnectionId::new();
        if self.slots.registry.add(id, now) {
            return Ok(Acquire::Create(Reservation {
                pool: self,
                id,
                created_at: now,
                armed: true,
            }));
        }

        waiters.retain(|tx| !tx.is_closed());
        if waiters.len() >= MAX_WAITERS {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::PoolExhausted(format!(
                "{} callers already waiting",
                waiters.len()
            )));
        }

        let (tx, rx) = oneshot::channel();
        waiters.push_back(tx);
        Ok(Acquire::Wait(WaitTicket { pool: self, rx }))
    }

    async fn create(&self, reservation: Reservation<'_, F>) -> Result<PooledConnection<F::Conn>> {
        let conn = match self.factory.create_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to create pooled connection: {}", e);
                return Err(e);
            }
        };

        let (id, created_at) = reservation.commit();
        if self.is_closed() {
            let mut conn = conn;
            conn.close("pool shutting down").await;
            return Err(GatewayError::PoolClosed);
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        info!("Created pooled connection {}", id);
        Ok(PooledConnection::new(id, created_at, conn).owned_by(self.owner()))
    }

    async fn wait_for_handoff(
        &self,
        mut ticket: WaitTicket<'_, F>,
        deadline: Instant,
    ) -> Result<Option<PooledConnection<F::Conn>>> {
        match timeout_at(deadline, &mut ticket.rx).await {
            Ok(Ok(Handoff::Connection(conn))) => {
                self.handed_off.fetch_add(1, Ordering::Relaxed);
                debug!("Received connection {} from a returning caller", conn.id());
                Ok(Some(conn))
            }
            Ok(Ok(Handoff::Capacity)) => Ok(None),
            Ok(Err(_)) => Err(GatewayError::PoolClosed),
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::PoolExhausted(format!(
                    "no connection became available within {:?}",
                    self.wait_timeout
                )))
            }
        }
    }

    /// Return a checked-out connection.
    ///
    /// A failed validation evicts the connection. After shutdown, or once
    /// cleanup has evicted it, the transport is closed instead of pooled.
    pub async fn put(&self, mut conn: PooledConnection<F::Conn>) -> Result<()> {
        if self.is_closed() {
            conn.into_inner().close("pool shutting down").await;
            return Err(GatewayError::PoolClosed);
        }

        let id = conn.id();
        if let Err(e) = self.factory.validate_connection(conn.conn_mut()).await {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Connection {} failed validation: {}", id, e);
            let registered = self.slots.registry.remove(id).is_ok();
            conn.into_inner().close("connection failed validation").await;
            if registered {
                self.slots.notify_capacity();
            }
            return Err(GatewayError::InvalidConnection(format!("{}: {}", id, e)));
        }

        match self.slots.place(conn) {
            Ok(()) => Ok(()),
            Err((conn, err)) => {
                debug!("Closing returned connection {}: {}", id, err);
                conn.into_inner().close("connection retired").await;
                Err(err)
            }
        }
    }

    /// Remove and close a connection unconditionally
    pub async fn close(&self, conn: PooledConnection<F::Conn>) -> Result<()> {
        let id = conn.id();
        let removed = self.slots.registry.remove(id);
        conn.into_inner().close("closed by caller").await;
        if self.is_closed() {
            return Err(GatewayError::PoolClosed);
        }
        removed?;
        self.slots.notify_capacity();
        debug!("Closed pooled connection {}", id);
        Ok(())
    }

    /// Evict expired and long-idle connections. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        if self.is_closed() {
            return Err(GatewayError::PoolClosed);
        }

        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let max_lifetime = self.config.max_lifetime;
        let removed = self.slots.registry.remove_where(|info| {
            info.is_expired(max_lifetime, now) || info.is_idle(idle_timeout, now)
        });

        let count = removed.len();
        for (info, conn) in removed {
            if let Some(mut conn) = conn {
                conn.close("connection expired").await;
            } else {
                debug!("Evicted connection {} while checked out", info.id);
            }
            self.slots.notify_capacity();
        }
        if count > 0 {
            debug!("Pool cleanup: removed {} connections", count);
        }
        Ok(count)
    }

    /// Cancel pending waits and close every idle connection.
    ///
    /// Connections still checked out are closed when they come back.
    pub async fn shutdown(&self) {
        let waiters = {
            let mut waiters = self.slots.lock_waiters();
            if self.slots.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *waiters)
        };
        // dropped senders resolve parked callers with PoolClosed
        let cancelled = waiters.len();
        drop(waiters);

        let mut closed = 0;
        for (_, conn) in self.slots.registry.drain() {
            if let Some(mut conn) = conn {
                conn.close("pool shutting down").await;
                closed += 1;
            }
        }
        info!(
            "Connection pool shut down: closed {} idle connections, cancelled {} waiters",
            closed, cancelled
        );
    }

    pub fn stats(&self) -> PoolStats {
        let waiting = self
            .slots
            .lock_waiters()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count();
        let (total, active) = self.slots.registry.usage();
        PoolStats {
            total,
            active,
            idle: total - active,
            capacity: self.slots.registry.capacity(),
            waiting,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            handed_off: self.handed_off.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

fn not_registered(id: ConnectionId) -> GatewayError {
    GatewayError::NotFound(format!("connection {} is no longer pooled", id))
}

/// Run `cleanup` every `cleanup_interval` until the listener fires
pub fn spawn_cleanup_task<F: ConnectionFactory>(
    pool: Arc<ConnectionPool<F>>,
    mut shutdown: ShutdownListener,
) -> JoinHandle<()> {
    let period = pool.config().cleanup_interval;
    info!("Pool cleanup task started (every {:?})", period);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match pool.cleanup().await {
                        Ok(_) => {
                            let stats = pool.stats();
                            debug!(
                                "Pool stats: {} total, {} active, {} idle",
                                stats.total, stats.active, stats.idle
                            );
                        }
                        Err(_) => break,
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Pool cleanup task stopped");
    })
}
