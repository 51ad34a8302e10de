//! Inference manager
//!
//! Consumes batches from the batcher, one at a time, and publishes each
//! result on a broadcast channel. A failed or timed-out call drops that
//! batch; the loop carries on with the next one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{InferenceClient, InferenceResult};
use super::preprocess::Preprocessor;
use crate::audio::AudioBatch;
use crate::logging::EventLogger;
use crate::shutdown::ShutdownListener;
use crate::types::{GatewayError, Result};

/// Time allowed for one inference call
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct InferenceManager {
    client: Arc<dyn InferenceClient>,
    preprocessor: Preprocessor,
    timeout: Duration,
    events: EventLogger,
    results: broadcast::Sender<InferenceResult>,
}

impl InferenceManager {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        preprocessor: Preprocessor,
        timeout: Duration,
        events: EventLogger,
        results: broadcast::Sender<InferenceResult>,
    ) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_INFERENCE_TIMEOUT
        } else {
            timeout
        };
        Self {
            client,
            preprocessor,
            timeout,
            events,
            results,
        }
    }

    pub fn client(&self) -> &Arc<dyn InferenceClient> {
        &self.client
    }

    /// Preprocess one batch and run inference on it under the timeout
    pub async fn process_batch(&self, batch: &AudioBatch) -> Result<InferenceResult> {
        let prepared = self.preprocessor.preprocess(batch);
        if prepared.is_empty() {
            return Err(GatewayError::InferenceFailed(format!(
                "no usable chunks in batch of {}",
                batch.size()
            )));
        }
        if let Some(duration) = self.preprocessor.audio_duration(&prepared) {
            debug!(
                "Batch for {} carries {:?} of audio",
                prepared.client_id, duration
            );
        }

        tokio::time::timeout(self.timeout, self.client.infer(&prepared))
            .await
            .map_err(|_| {
                GatewayError::InferenceFailed(format!("timed out after {:?}", self.timeout))
            })?
    }

    /// Consume batches until the channel closes or shutdown fires
    pub fn spawn(
        self: Arc<Self>,
        mut batches: mpsc::Receiver<AudioBatch>,
        mut shutdown: ShutdownListener,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Inference manager started");
            loop {
                let batch = tokio::select! {
                    batch = batches.recv() => match batch {
                        Some(batch) => batch,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };

                // a call in flight is abandoned at shutdown
                tokio::select! {
                    _ = self.handle_batch(batch) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("Inference manager stopped");
        })
    }

    async fn handle_batch(&self, batch: AudioBatch) {
        let started = tokio::time::Instant::now();
        match self.process_batch(&batch).await {
            Ok(result) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.events
                    .inference_result(&result.client_id, &result.result, elapsed);
                // no subscribers is not an error
                let _ = self.results.send(result);
            }
            Err(e) => {
                warn!("Inference failed for {}: {}", batch.client_id, e);
                self.events
                    .inference_failed(&batch.client_id, batch.size(), &e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::StubInferenceClient;
    use crate::shutdown::Shutdown;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fails or stalls on request, otherwise answers with the chunk count
    #[derive(Default)]
    struct ScriptedClient {
        fail_next: AtomicBool,
        stall_next: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn server_status(&self) -> String {
            "scripted".to_string()
        }

        async fn infer(&self, batch: &AudioBatch) -> Result<InferenceResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall_next.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(GatewayError::InferenceFailed("backend error".into()));
            }
            Ok(InferenceResult {
                client_id: batch.client_id.clone(),
                result: format!("{} chunks", batch.size()),
                confidence: 1.0,
                processing_time_ms: 0,
                batch_size: batch.size(),
            })
        }
    }

    fn manager(
        client: Arc<dyn InferenceClient>,
    ) -> (Arc<InferenceManager>, broadcast::Receiver<InferenceResult>) {
        let (results, rx) = broadcast::channel(16);
        let manager = InferenceManager::new(
            client,
            Preprocessor::default(),
            DEFAULT_INFERENCE_TIMEOUT,
            EventLogger::new("test-node"),
            results,
        );
        (Arc::new(manager), rx)
    }

    fn batch(client_id: &str, n: usize) -> AudioBatch {
        AudioBatch::new(client_id, vec![Bytes::from_static(b"pcm"); n])
    }

    #[tokio::test]
    async fn test_stub_result_is_published() {
        let client = Arc::new(StubInferenceClient::new("localhost:50051"));
        client.connect().await.unwrap();
        let (manager, mut results) = manager(client);

        let (tx, rx) = mpsc::channel(4);
        let shutdown = Shutdown::new();
        let task = manager.spawn(rx, shutdown.subscribe());

        tx.send(batch("c1", 2)).await.unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.client_id, "c1");
        assert_eq!(result.batch_size, 2);
        assert_eq!(result.confidence, 0.95);

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_loop() {
        let client = Arc::new(ScriptedClient::default());
        client.fail_next.store(true, Ordering::SeqCst);
        let (manager, mut results) = manager(client.clone());

        let (tx, rx) = mpsc::channel(4);
        let shutdown = Shutdown::new();
        let task = manager.spawn(rx, shutdown.subscribe());

        tx.send(batch("c1", 1)).await.unwrap();
        tx.send(batch("c2", 3)).await.unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.client_id, "c2");
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        // closing the batch channel also ends the loop
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let client = Arc::new(ScriptedClient::default());
        client.stall_next.store(true, Ordering::SeqCst);
        let (manager, _results) = manager(client);

        let started = tokio::time::Instant::now();
        let err = manager.process_batch(&batch("c1", 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::InferenceFailed(_)));
        assert!(started.elapsed() >= DEFAULT_INFERENCE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_call_in_flight() {
        let client = Arc::new(ScriptedClient::default());
        client.stall_next.store(true, Ordering::SeqCst);
        let (manager, _results) = manager(client.clone());

        let (tx, rx) = mpsc::channel(4);
        let shutdown = Shutdown::new();
        let task = manager.spawn(rx, shutdown.subscribe());

        tx.send(batch("c1", 1)).await.unwrap();
        while client.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }
}
