//! Pipeline lifecycle events
//!
//! Every event goes through `tracing`. When a file is configured the same
//! event is also queued to a background writer that appends it as one JSON
//! line, so callers never wait on file I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Events queued for the file writer before new ones are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Lifecycle event types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Streaming client connected
    ClientConnected,
    /// Streaming client went away
    ClientDisconnected,
    /// A batch was queued for inference
    BatchReady,
    /// A batch was dropped because the batch channel was full
    BatchDropped,
    /// Inference produced a result
    InferenceResult,
    /// Inference failed or timed out
    InferenceFailed,
}

/// One lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    /// Gateway node that produced the event
    pub node_id: String,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    /// Number of chunks in the batch
    pub batch_size: Option<usize>,
    pub bytes: Option<u64>,
    pub duration_ms: Option<u64>,
    /// Free-form detail (error text, inference result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PipelineEvent {
    pub fn new(event_type: EventType, node_id: String) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            node_id,
            client_id: None,
            session_id: None,
            batch_size: None,
            bytes: None,
            duration_ms: None,
            detail: None,
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Emits pipeline events, optionally mirroring them to a JSONL file
#[derive(Clone)]
pub struct EventLogger {
    inner: Arc<Mutex<EventLoggerInner>>,
    node_id: String,
}

struct EventLoggerInner {
    writer: Option<mpsc::Sender<WriterCommand>>,
    path: Option<PathBuf>,
}

enum WriterCommand {
    Line(String),
    Flush(oneshot::Sender<()>),
}

impl EventLogger {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventLoggerInner {
                writer: None,
                path: None,
            })),
            node_id: node_id.into(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventLoggerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start appending events to the file at `path`
    pub async fn init_file(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(write_events(file, rx));

        let mut inner = self.lock();
        inner.writer = Some(tx);
        inner.path = Some(path.to_path_buf());

        info!("Event logging initialized to {}", path.display());
        Ok(())
    }

    pub fn log(&self, event: PipelineEvent) {
        let client = event.client_id.as_deref().unwrap_or("-");
        match event.event_type {
            EventType::BatchDropped | EventType::InferenceFailed => warn!(
                event = ?event.event_type,
                client_id = client,
                batch_size = event.batch_size,
                detail = event.detail.as_deref(),
                "pipeline event"
            ),
            _ => info!(
                event = ?event.event_type,
                client_id = client,
                batch_size = event.batch_size,
                detail = event.detail.as_deref(),
                "pipeline event"
            ),
        }

        let Some(writer) = self.lock().writer.clone() else {
            return;
        };

        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize pipeline event: {}", e);
                return;
            }
        };
        if let Err(e) = writer.try_send(WriterCommand::Line(jsonl)) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Event log queue full, dropping {:?} event", event.event_type)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    error!("Event log writer stopped, dropping {:?} event", event.event_type)
                }
            }
        }
    }

    /// Wait until every event queued so far is on disk
    pub async fn flush(&self) {
        let Some(writer) = self.lock().writer.clone() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if writer.send(WriterCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn client_connected(&self, client_id: &str, session_id: &str) {
        self.log(
            PipelineEvent::new(EventType::ClientConnected, self.node_id.clone())
                .with_client(client_id)
                .with_session(session_id),
        );
    }

    pub fn client_disconnected(&self, client_id: &str, session_id: &str, duration_ms: u64) {
        self.log(
            PipelineEvent::new(EventType::ClientDisconnected, self.node_id.clone())
                .with_client(client_id)
                .with_session(session_id)
                .with_duration(duration_ms),
        );
    }

    pub fn batch_ready(&self, client_id: &str, batch_size: usize, bytes: u64) {
        self.log(
            PipelineEvent::new(EventType::BatchReady, self.node_id.clone())
                .with_client(client_id)
                .with_batch_size(batch_size)
                .with_bytes(bytes),
        );
    }

    pub fn batch_dropped(&self, client_id: &str, batch_size: usize) {
        self.log(
            PipelineEvent::new(EventType::BatchDropped, self.node_id.clone())
                .with_client(client_id)
                .with_batch_size(batch_size)
                .with_detail("batch channel full"),
        );
    }

    pub fn inference_result(&self, client_id: &str, result: &str, duration_ms: u64) {
        self.log(
            PipelineEvent::new(EventType::InferenceResult, self.node_id.clone())
                .with_client(client_id)
                .with_duration(duration_ms)
                .with_detail(result),
        );
    }

    pub fn inference_failed(&self, client_id: &str, batch_size: usize, error: &str) {
        self.log(
            PipelineEvent::new(EventType::InferenceFailed, self.node_id.clone())
                .with_client(client_id)
                .with_batch_size(batch_size)
                .with_detail(error),
        );
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Path of the JSONL mirror, if one is configured
    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }
}

async fn write_events(file: File, mut rx: mpsc::Receiver<WriterCommand>) {
    let mut writer = BufWriter::new(file);
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Line(mut line) => {
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!("Failed to write pipeline event: {}", e);
                }
                // batch writes while more events are queued
                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        error!("Failed to flush event log: {}", e);
                    }
                }
            }
            WriterCommand::Flush(done) => {
                if let Err(e) = writer.flush().await {
                    error!("Failed to flush event log: {}", e);
                }
                let _ = done.send(());
            }
        }
    }
    if let Err(e) = writer.flush().await {
        error!("Failed to flush event log: {}", e);
    }
    debug!("Event log writer stopped");
}
