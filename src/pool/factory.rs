//! Connection factories
//!
//! The pool never dials anything itself. A factory produces new transports
//! and optionally health-checks one before it is returned to the idle set.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use super::config::ConnectionOptions;
use super::connection::Transport;
use crate::types::{GatewayError, Result};

/// Client WebSocket stream produced by [`WebSocketFactory`]
pub type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Produces and validates transports for a pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Transport;

    /// Open a new transport
    async fn create_connection(&self) -> Result<Self::Conn>;

    /// Health check run on `put`. Accepts everything unless overridden.
    async fn validate_connection(&self, _conn: &mut Self::Conn) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Transport for WsConnection {
    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        if let Err(e) = WebSocketStream::close(self, Some(frame)).await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

/// Opens WebSocket client connections to a fixed endpoint
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    options: ConnectionOptions,
}

impl WebSocketFactory {
    pub fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

#[async_trait]
impl ConnectionFactory for WebSocketFactory {
    type Conn = WsConnection;

    async fn create_connection(&self) -> Result<WsConnection> {
        let url = &self.options.server_url;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::ConnectFailed(format!("Invalid URL {}: {}", url, e)))?;

        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| GatewayError::ConnectFailed(format!("Invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::ConnectFailed(format!("Invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        if !self.options.subprotocols.is_empty() {
            let protocols = self.options.subprotocols.join(", ");
            let value = HeaderValue::from_str(&protocols)
                .map_err(|e| GatewayError::ConnectFailed(format!("Invalid subprotocol: {}", e)))?;
            request
                .headers_mut()
                .insert(HeaderName::from_static("sec-websocket-protocol"), value);
        }

        let (ws, _) = timeout(
            self.options.connect_timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| {
            GatewayError::ConnectFailed(format!(
                "Timeout connecting to {} after {:?}",
                url, self.options.connect_timeout
            ))
        })?
        .map_err(|e| GatewayError::ConnectFailed(format!("WebSocket connect failed: {}", e)))?;

        debug!("Opened WebSocket connection to {}", url);
        Ok(ws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::config::PoolConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn options(url: &str, connect_timeout: Duration) -> ConnectionOptions {
        let mut options = PoolConfig::new(url).connection_options();
        options.connect_timeout = connect_timeout;
        options
    }

    #[tokio::test]
    async fn test_malformed_url_fails_to_connect() {
        let factory = WebSocketFactory::new(options("not a url", Duration::from_secs(1)));
        let err = factory.create_connection().await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn test_refused_port_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = WebSocketFactory::new(options(
            &format!("ws://{}/audio", addr),
            Duration::from_secs(2),
        ));
        let err = factory.create_connection().await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // accepts TCP but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let factory = WebSocketFactory::new(options(
            &format!("ws://{}/audio", addr),
            Duration::from_millis(200),
        ));
        let err = factory.create_connection().await.unwrap_err();
        match err {
            GatewayError::ConnectFailed(msg) => assert!(msg.contains("Timeout")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
