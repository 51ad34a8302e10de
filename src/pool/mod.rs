//! Bounded pool of outbound transport connections
//!
//! Used by the load generator to reuse WebSocket connections to the
//! gateway instead of dialing one per stream.

pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod factory;
pub mod registry;

pub use config::{ConnectionOptions, PoolConfig};
pub use connection::{ConnectionId, ConnectionInfo, PooledConnection, Transport};
pub use connection_pool::{spawn_cleanup_task, ConnectionPool, PoolStats, MAX_WAITERS, WAIT_TIMEOUT};
pub use factory::{ConnectionFactory, WebSocketFactory, WsConnection};
pub use registry::PoolRegistry;
