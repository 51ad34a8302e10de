//! Audio batcher
//!
//! Buffers chunks per client and emits a batch when a client's buffer
//! reaches the batch size, or when the periodic sweep finds it older than
//! the flush timeout. Batches go out on a bounded channel with `try_send`;
//! a full channel drops the batch instead of stalling the reader.
//!
//! One mutex guards every client buffer together with its last-flush time,
//! and sends happen while it is held, so batches for one client reach the
//! channel in the order their triggers fired.

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::batch::AudioBatch;
use crate::logging::EventLogger;
use crate::shutdown::ShutdownListener;
use crate::types::{GatewayError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Batching configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Chunks per count-triggered batch
    pub batch_size: usize,
    /// Maximum age of buffered chunks, and the sweep period
    pub flush_timeout: Duration,
    /// Capacity of the outgoing batch channel
    pub channel_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl BatcherConfig {
    /// Replace zero values with defaults
    pub fn validated(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.flush_timeout.is_zero() {
            self.flush_timeout = DEFAULT_FLUSH_TIMEOUT;
        }
        if self.channel_capacity == 0 {
            self.channel_capacity = DEFAULT_CHANNEL_CAPACITY;
        }
        self
    }
}

struct ClientBuffer {
    chunks: Vec<Bytes>,
    last_flush: Instant,
}

impl ClientBuffer {
    fn new(now: Instant) -> Self {
        Self {
            chunks: Vec::new(),
            last_flush: now,
        }
    }
}

/// Outcome of one flush, reported once the buffer lock is released
enum Emission {
    Sent {
        client_id: String,
        size: usize,
        bytes: usize,
    },
    Dropped {
        client_id: String,
        size: usize,
    },
}

/// Batcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub chunks_received: u64,
    pub batches_emitted: u64,
    pub batches_dropped: u64,
    /// Clients with a buffer, empty or not. Buffers are never evicted.
    pub buffered_clients: usize,
    pub buffered_chunks: usize,
}

pub struct AudioBatcher {
    config: BatcherConfig,
    buffers: Mutex<HashMap<String, ClientBuffer>>,
    batch_tx: mpsc::Sender<AudioBatch>,
    events: EventLogger,
    chunks_received: AtomicU64,
    batches_emitted: AtomicU64,
    batches_dropped: AtomicU64,
}

impl AudioBatcher {
    /// Create a batcher and the receiving end of its batch channel
    pub fn new(config: BatcherConfig, events: EventLogger) -> (Self, mpsc::Receiver<AudioBatch>) {
        let config = config.validated();
        let (batch_tx, batch_rx) = mpsc::channel(config.channel_capacity);
        let batcher = Self {
            config,
            buffers: Mutex::new(HashMap::new()),
            batch_tx,
            events,
            chunks_received: AtomicU64::new(0),
            batches_emitted: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
        };
        (batcher, batch_rx)
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClientBuffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer one chunk, flushing the client's buffer if it is now full.
    ///
    /// Fails with `ChannelSaturated` when that flush had to drop the batch;
    /// the chunk itself was still accepted.
    pub fn add_audio_data(&self, client_id: &str, chunk: Bytes) -> Result<()> {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        let emission = {
            let mut buffers = self.lock();
            let now = Instant::now();
            match buffers.get_mut(client_id) {
                Some(buffer) => self.push_chunk(client_id, buffer, chunk, now),
                None => {
                    let buffer = buffers
                        .entry(client_id.to_string())
                        .or_insert_with(|| ClientBuffer::new(now));
                    self.push_chunk(client_id, buffer, chunk, now)
                }
            }
        };
        match emission {
            Some(emission) => self.report(emission).map(|_| ()),
            None => Ok(()),
        }
    }

    fn push_chunk(
        &self,
        client_id: &str,
        buffer: &mut ClientBuffer,
        chunk: Bytes,
        now: Instant,
    ) -> Option<Emission> {
        buffer.chunks.push(chunk);
        if buffer.chunks.len() >= self.config.batch_size {
            self.flush_buffer(client_id, buffer, now)
        } else {
            None
        }
    }

    /// Flush one client's buffer now.
    ///
    /// Returns the size of the emitted batch, or `None` if there was nothing
    /// buffered.
    pub fn flush(&self, client_id: &str) -> Result<Option<usize>> {
        let emission = {
            let mut buffers = self.lock();
            let Some(buffer) = buffers.get_mut(client_id) else {
                return Ok(None);
            };
            self.flush_buffer(client_id, buffer, Instant::now())
        };
        match emission {
            Some(emission) => self.report(emission).map(Some),
            None => Ok(None),
        }
    }

    /// Flush every non-empty buffer whose last flush is at least one flush
    /// timeout old. Returns the number of batches flushed, dropped ones
    /// included.
    pub fn flush_expired(&self) -> usize {
        let emissions: Vec<Emission> = {
            let mut buffers = self.lock();
            let now = Instant::now();
            let timeout = self.config.flush_timeout;
            buffers
                .iter_mut()
                .filter(|(_, buffer)| {
                    !buffer.chunks.is_empty()
                        && now.saturating_duration_since(buffer.last_flush) >= timeout
                })
                .filter_map(|(client_id, buffer)| self.flush_buffer(client_id, buffer, now))
                .collect()
        };

        let count = emissions.len();
        for emission in emissions {
            // drops are already reported through the event log
            let _ = self.report(emission);
        }
        if count > 0 {
            debug!("Flush sweep emitted {} timed-out batches", count);
        }
        count
    }

    /// Snapshot and reset a buffer, then try to queue the batch.
    /// Caller holds the buffer lock.
    fn flush_buffer(&self, client_id: &str, buffer: &mut ClientBuffer, now: Instant) -> Option<Emission> {
        if buffer.chunks.is_empty() {
            return None;
        }
        let batch = AudioBatch::new(client_id, std::mem::take(&mut buffer.chunks));
        buffer.last_flush = now;

        let size = batch.size();
        let bytes = batch.total_bytes();
        match self.batch_tx.try_send(batch) {
            Ok(()) => Some(Emission::Sent {
                client_id: client_id.to_string(),
                size,
                bytes,
            }),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => Some(Emission::Dropped {
                client_id: client_id.to_string(),
                size,
            }),
        }
    }

    fn report(&self, emission: Emission) -> Result<usize> {
        match emission {
            Emission::Sent {
                client_id,
                size,
                bytes,
            } => {
                self.batches_emitted.fetch_add(1, Ordering::Relaxed);
                self.events.batch_ready(&client_id, size, bytes as u64);
                Ok(size)
            }
            Emission::Dropped { client_id, size } => {
                self.batches_dropped.fetch_add(1, Ordering::Relaxed);
                self.events.batch_dropped(&client_id, size);
                Err(GatewayError::ChannelSaturated { client_id, size })
            }
        }
    }

    pub fn stats(&self) -> BatcherStats {
        let (buffered_clients, buffered_chunks) = {
            let buffers = self.lock();
            let chunks = buffers.values().map(|buffer| buffer.chunks.len()).sum();
            (buffers.len(), chunks)
        };
        BatcherStats {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            batches_emitted: self.batches_emitted.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            buffered_clients,
            buffered_chunks,
        }
    }

    /// Start the periodic sweep, one flush timeout apart, until cancelled.
    ///
    /// Buffers are only checked on ticks, so a lone chunk can wait just under
    /// two flush timeouts before it is emitted.
    pub fn spawn_flush_task(self: &Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        let period = self.config.flush_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        batcher.flush_expired();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Batch flush task stopped");
        })
    }
}
