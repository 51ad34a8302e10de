use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One client's chunks, in arrival order, ready for inference.
///
/// Never modified after construction; cloning shares the chunk buffers.
#[derive(Debug, Clone)]
pub struct AudioBatch {
    pub client_id: String,
    pub chunks: Vec<Bytes>,
    pub created_at: DateTime<Utc>,
}

impl AudioBatch {
    pub fn new(client_id: impl Into<String>, chunks: Vec<Bytes>) -> Self {
        Self {
            client_id: client_id.into(),
            chunks,
            created_at: Utc::now(),
        }
    }

    /// Number of chunks
    pub fn size(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
