//! Connection pool configuration
//!
//! Values are fixed at construction. Zero values are replaced with the
//! defaults below rather than rejected.

use std::time::Duration;

/// Default maximum number of registered connections
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;
/// Default time allowed to open one connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time an idle connection is kept
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default maximum age of any connection
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);
/// Default period between externally scheduled cleanups
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Identifying user agent attached to every pooled connection
pub const POOL_USER_AGENT: &str = "connection-pool-client/1.0";

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections registered at once
    pub max_pool_size: usize,
    /// Timeout for opening one connection
    pub connect_timeout: Duration,
    /// Idle connections older than this are evicted by cleanup
    pub idle_timeout: Duration,
    /// Any connection older than this is evicted by cleanup
    pub max_lifetime: Duration,
    /// How often the owner should call cleanup
    pub cleanup_interval: Duration,
    /// Remote endpoint every connection is opened against
    pub server_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            server_url: "ws://localhost:8080/audio".to_string(),
        }
    }
}

impl PoolConfig {
    /// Config with defaults for everything except the endpoint
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Replace zero values with defaults
    pub fn validated(mut self) -> Self {
        if self.max_pool_size == 0 {
            self.max_pool_size = DEFAULT_MAX_POOL_SIZE;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if self.max_lifetime.is_zero() {
            self.max_lifetime = DEFAULT_MAX_LIFETIME;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = DEFAULT_CLEANUP_INTERVAL;
        }
        self
    }

    /// Options handed to the connection factory
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            server_url: self.server_url.clone(),
            connect_timeout: self.connect_timeout,
            headers: vec![("User-Agent".to_string(), POOL_USER_AGENT.to_string())],
            subprotocols: Vec::new(),
        }
    }
}

/// Options used when dialing a single connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub server_url: String,
    pub connect_timeout: Duration,
    /// Extra request headers, applied in order
    pub headers: Vec<(String, String)>,
    pub subprotocols: Vec<String>,
}

impl ConnectionOptions {
    /// Add (or override) a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.subprotocols.push(protocol.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values_are_defaulted() {
        let config = PoolConfig {
            max_pool_size: 0,
            connect_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            server_url: "ws://example:9000".to_string(),
        }
        .validated();

        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.server_url, "ws://example:9000");
    }

    #[test]
    fn test_explicit_values_survive_validation() {
        let config = PoolConfig {
            max_pool_size: 3,
            idle_timeout: Duration::from_secs(5),
            ..PoolConfig::new("ws://example:9000")
        }
        .validated();

        assert_eq!(config.max_pool_size, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_connection_options_carry_user_agent() {
        let options = PoolConfig::new("ws://example:9000")
            .connection_options()
            .with_header("X-Client-ID", "tuning")
            .with_header("user-agent", "override/2.0");

        assert_eq!(options.headers.len(), 2);
        assert!(options
            .headers
            .iter()
            .any(|(k, v)| k == "X-Client-ID" && v == "tuning"));
        assert!(options
            .headers
            .iter()
            .any(|(k, v)| k == "user-agent" && v == "override/2.0"));
    }
}
