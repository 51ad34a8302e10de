//! Inference backend client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::AudioBatch;
use crate::types::{GatewayError, Result};

/// Result of running inference on one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub client_id: String,
    pub result: String,
    pub confidence: f64,
    /// Backend-reported processing time
    pub processing_time_ms: u64,
    /// Chunks in the batch that produced this result
    pub batch_size: usize,
}

/// Connection to an inference backend
#[async_trait]
pub trait InferenceClient: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Short human-readable backend state for health output
    fn server_status(&self) -> String;

    /// Run inference on one batch
    async fn infer(&self, batch: &AudioBatch) -> Result<InferenceResult>;
}

/// Placeholder backend that answers every batch with a fixed result
pub struct StubInferenceClient {
    server_address: String,
    connected: AtomicBool,
}

/// Confidence reported by the placeholder backend
pub const STUB_CONFIDENCE: f64 = 0.95;
const STUB_PROCESSING_TIME: Duration = Duration::from_millis(50);

impl StubInferenceClient {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }
}

#[async_trait]
impl InferenceClient for StubInferenceClient {
    async fn connect(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Connected to inference server at {}", self.server_address);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Disconnected from inference server at {}", self.server_address);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn server_status(&self) -> String {
        if self.is_connected() {
            "connected".to_string()
        } else {
            "disconnected".to_string()
        }
    }

    async fn infer(&self, batch: &AudioBatch) -> Result<InferenceResult> {
        if !self.is_connected() {
            return Err(GatewayError::InferenceFailed(format!(
                "not connected to {}",
                self.server_address
            )));
        }
        debug!(
            client_id = %batch.client_id,
            batch_size = batch.size(),
            "Sending batch to inference server"
        );
        Ok(InferenceResult {
            client_id: batch.client_id.clone(),
            result: "placeholder inference result".to_string(),
            confidence: STUB_CONFIDENCE,
            processing_time_ms: STUB_PROCESSING_TIME.as_millis() as u64,
            batch_size: batch.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_stub_requires_connection() {
        let client = StubInferenceClient::new("localhost:50051");
        let batch = AudioBatch::new("c1", vec![Bytes::from_static(b"pcm")]);

        assert_eq!(client.server_status(), "disconnected");
        assert!(matches!(
            client.infer(&batch).await,
            Err(GatewayError::InferenceFailed(_))
        ));

        client.connect().await.unwrap();
        assert!(client.is_connected());
        let result = client.infer(&batch).await.unwrap();
        assert_eq!(result.client_id, "c1");
        assert_eq!(result.confidence, STUB_CONFIDENCE);
        assert_eq!(result.batch_size, 1);

        client.disconnect().await.unwrap();
        assert_eq!(client.server_status(), "disconnected");
    }
}
