//! Error types for the audio gateway
//!
//! Pool errors go back to the immediate caller and are never retried inside
//! the pool. Pipeline errors (`InferenceFailed`, `ChannelSaturated`) are
//! logged by the background loops and never stop them.

use hyper::StatusCode;

/// Main error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pool is shut down")]
    PoolClosed,

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Batch channel saturated: dropped batch of {size} chunks for client {client_id}")]
    ChannelSaturated { client_id: String, size: usize },

    #[error("Client limit reached: {0} sessions")]
    TooManyClients(usize),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConnectFailed(_) => StatusCode::BAD_GATEWAY,
            Self::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidConnection(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::InferenceFailed(_) => StatusCode::BAD_GATEWAY,
            Self::ChannelSaturated { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooManyClients(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::WebSocket(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
