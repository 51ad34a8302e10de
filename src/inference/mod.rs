//! Inference stage
//!
//! Batches leaving the batcher are preprocessed, sent to the inference
//! backend under a fixed timeout, and the results republished.

pub mod client;
pub mod manager;
pub mod preprocess;

pub use client::{InferenceClient, InferenceResult, StubInferenceClient};
pub use manager::{InferenceManager, DEFAULT_INFERENCE_TIMEOUT};
pub use preprocess::{PreprocessConfig, PreprocessKey, Preprocessor};
