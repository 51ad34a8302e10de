//! Audio gateway - WebSocket audio ingest with per-client batching
//!
//! Clients stream binary audio chunks over `/audio`. Chunks are buffered per
//! client id and flushed as batches once a client has sent `batch_size`
//! chunks or its buffer has waited `flush_timeout`. Batches pass through a
//! bounded channel (full means dropped) into the inference stage, whose
//! results go back to the client that produced them.
//!
//! ## Components
//!
//! - **Batcher**: per-client buffers with count and time triggers
//! - **Inference**: preprocessing plus a pluggable inference client
//! - **Pipeline**: sessions, batcher and inference wired together
//! - **Pool**: bounded WebSocket client connection pool with wait hand-off
//! - **Tuning**: load generator built on the pool

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod inference;
pub mod logging;
pub mod pool;
pub mod routes;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tuning;
pub mod types;

pub use config::{Args, TuningArgs};
pub use coordinator::{AudioPipeline, PipelineConfig};
pub use server::{run, serve, AppState};
pub use types::{GatewayError, Result};
