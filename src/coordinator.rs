//! Audio pipeline coordinator
//!
//! Wires sessions, the batcher and the inference manager together and owns
//! their background tasks. All shared state lives in the parts it delegates
//! to; the coordinator itself only holds handles.

use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audio::{AudioBatcher, BatcherConfig, BatcherStats};
use crate::inference::{
    InferenceClient, InferenceManager, InferenceResult, PreprocessConfig, Preprocessor,
    DEFAULT_INFERENCE_TIMEOUT,
};
use crate::logging::EventLogger;
use crate::session::{ClientSession, SessionStore};
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::types::{GatewayError, Result};

/// Default cap on concurrent streaming sessions
pub const DEFAULT_MAX_CLIENTS: usize = 100;

/// Capacity of the result broadcast channel
const RESULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batcher: BatcherConfig,
    pub preprocess: PreprocessConfig,
    pub inference_timeout: Duration,
    pub max_clients: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
            preprocess: PreprocessConfig::default(),
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// Pipeline counters for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub sessions: usize,
    pub max_sessions: usize,
    pub batcher: BatcherStats,
    pub inference_status: String,
}

pub struct AudioPipeline {
    sessions: SessionStore,
    batcher: Arc<AudioBatcher>,
    inference: Arc<InferenceManager>,
    results: broadcast::Sender<InferenceResult>,
    events: EventLogger,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioPipeline {
    /// Connect the inference client and start the sweep and inference loops
    pub async fn start(
        config: PipelineConfig,
        client: Arc<dyn InferenceClient>,
        events: EventLogger,
    ) -> Result<Arc<Self>> {
        client.connect().await?;

        let (batcher, batch_rx) = AudioBatcher::new(config.batcher, events.clone());
        let batcher = Arc::new(batcher);
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let inference = Arc::new(InferenceManager::new(
            client,
            Preprocessor::new(config.preprocess),
            config.inference_timeout,
            events.clone(),
            results.clone(),
        ));

        let shutdown = Shutdown::new();
        let tasks = vec![
            batcher.spawn_flush_task(shutdown.subscribe()),
            Arc::clone(&inference).spawn(batch_rx, shutdown.subscribe()),
        ];

        info!(
            "Audio pipeline started: batch size {}, flush timeout {:?}",
            batcher.config().batch_size,
            batcher.config().flush_timeout
        );

        Ok(Arc::new(Self {
            sessions: SessionStore::new(config.max_clients),
            batcher,
            inference,
            results,
            events,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn register_client(
        &self,
        client_id: &str,
        peer_addr: Option<SocketAddr>,
    ) -> Result<ClientSession> {
        let session = ClientSession::new(client_id, peer_addr);
        self.sessions.insert(session.clone())?;
        self.events
            .client_connected(&session.client_id, &session.session_id.to_string());
        Ok(session)
    }

    pub fn unregister_client(&self, session_id: &Uuid) -> Option<ClientSession> {
        let session = self.sessions.remove(session_id)?;
        self.events.client_disconnected(
            &session.client_id,
            &session.session_id.to_string(),
            session.duration_ms(),
        );
        Some(session)
    }

    /// Route one chunk into the batcher
    pub fn process_audio_data(&self, client_id: &str, chunk: Bytes) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(GatewayError::Internal("audio pipeline is shut down".to_string()));
        }
        self.batcher.add_audio_data(client_id, chunk)
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<InferenceResult> {
        self.results.subscribe()
    }

    pub fn shutdown_listener(&self) -> ShutdownListener {
        self.shutdown.subscribe()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            sessions: self.sessions.session_count(),
            max_sessions: self.sessions.max_sessions(),
            batcher: self.batcher.stats(),
            inference_status: self.inference.client().server_status(),
        }
    }

    pub fn inference_connected(&self) -> bool {
        self.inference.client().is_connected()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Stop the background loops and wait for them. Later calls return at once.
    pub async fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        info!("Audio pipeline shutting down");

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.inference.client().disconnect().await {
            warn!("Failed to disconnect inference client: {}", e);
        }
        info!("Audio pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::StubInferenceClient;

    async fn pipeline(batch_size: usize, max_clients: usize) -> Arc<AudioPipeline> {
        let config = PipelineConfig {
            batcher: BatcherConfig {
                batch_size,
                ..BatcherConfig::default()
            },
            max_clients,
            ..PipelineConfig::default()
        };
        let client = Arc::new(StubInferenceClient::new("localhost:50051"));
        AudioPipeline::start(config, client, EventLogger::new("test-node"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_chunks_become_results() {
        let pipeline = pipeline(2, 10).await;
        let mut results = pipeline.subscribe_results();

        pipeline.process_audio_data("c1", Bytes::from_static(b"a")).unwrap();
        pipeline.process_audio_data("c1", Bytes::from_static(b"b")).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("result should arrive")
            .unwrap();
        assert_eq!(result.client_id, "c1");
        assert_eq!(result.batch_size, 2);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_sessions_are_capped() {
        let pipeline = pipeline(10, 1).await;
        let session = pipeline.register_client("c1", None).unwrap();
        assert!(matches!(
            pipeline.register_client("c2", None),
            Err(GatewayError::TooManyClients(1))
        ));

        assert!(pipeline.unregister_client(&session.session_id).is_some());
        assert!(pipeline.unregister_client(&session.session_id).is_none());
        assert!(pipeline.register_client("c2", None).is_ok());
        assert_eq!(pipeline.stats().sessions, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pipeline = pipeline(10, 10).await;
        pipeline.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), pipeline.shutdown())
            .await
            .expect("second shutdown returns at once");

        assert!(pipeline
            .process_audio_data("c1", Bytes::from_static(b"a"))
            .is_err());
        assert_eq!(pipeline.stats().inference_status, "disconnected");
    }
}
