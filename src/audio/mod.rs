//! Per-client audio batching

pub mod batch;
pub mod batcher;

pub use batch::AudioBatch;
pub use batcher::{AudioBatcher, BatcherConfig, BatcherStats};
