//! Batch preprocessing
//!
//! Options are a closed set of typed keys, parsed from `key=value` pairs.
//! The default configuration passes chunks through unchanged.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::audio::AudioBatch;
use crate::types::{GatewayError, Result};

/// Recognised preprocessing options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessKey {
    /// Peak-normalise 16-bit little-endian PCM
    Normalize,
    /// Drop chunks shorter than this many bytes
    MinChunkBytes,
    /// Sample rate of the incoming PCM, used for duration accounting
    SampleRateHz,
}

impl PreprocessKey {
    pub const ALL: [PreprocessKey; 3] = [Self::Normalize, Self::MinChunkBytes, Self::SampleRateHz];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::MinChunkBytes => "min_chunk_bytes",
            Self::SampleRateHz => "sample_rate_hz",
        }
    }
}

impl fmt::Display for PreprocessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreprocessKey {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| {
                GatewayError::Config(format!("Unknown preprocessing option: {}", s))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessConfig {
    pub normalize: bool,
    pub min_chunk_bytes: usize,
    pub sample_rate_hz: Option<u32>,
}

impl PreprocessConfig {
    /// Parse a list of `key=value` options
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                GatewayError::Config(format!("Expected key=value, got: {}", pair))
            })?;
            config.set(key.trim().parse()?, value.trim())?;
        }
        Ok(config)
    }

    pub fn set(&mut self, key: PreprocessKey, value: &str) -> Result<()> {
        let invalid =
            |e: &dyn fmt::Display| GatewayError::Config(format!("Invalid value for {}: {}", key, e));
        match key {
            PreprocessKey::Normalize => {
                self.normalize = value.parse().map_err(|e| invalid(&e))?;
            }
            PreprocessKey::MinChunkBytes => {
                self.min_chunk_bytes = value.parse().map_err(|e| invalid(&e))?;
            }
            PreprocessKey::SampleRateHz => {
                let rate: u32 = value.parse().map_err(|e| invalid(&e))?;
                if rate == 0 {
                    return Err(invalid(&"sample rate must be positive"));
                }
                self.sample_rate_hz = Some(rate);
            }
        }
        Ok(())
    }
}

/// Applies a [`PreprocessConfig`] to batches
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Produce the batch sent to inference. The input batch is not modified.
    pub fn preprocess(&self, batch: &AudioBatch) -> AudioBatch {
        let chunks: Vec<Bytes> = batch
            .chunks
            .iter()
            .filter(|chunk| chunk.len() >= self.config.min_chunk_bytes)
            .map(|chunk| {
                if self.config.normalize {
                    normalize_pcm16(chunk)
                } else {
                    chunk.clone()
                }
            })
            .collect();

        let dropped = batch.size() - chunks.len();
        if dropped > 0 {
            debug!(
                "Dropped {} short chunks from batch for {}",
                dropped, batch.client_id
            );
        }

        AudioBatch {
            client_id: batch.client_id.clone(),
            chunks,
            created_at: batch.created_at,
        }
    }

    /// Audio duration of a batch of 16-bit mono PCM, if the rate is known
    pub fn audio_duration(&self, batch: &AudioBatch) -> Option<Duration> {
        let rate = self.config.sample_rate_hz?;
        let samples = (batch.total_bytes() / 2) as u64;
        Some(Duration::from_micros(samples * 1_000_000 / rate as u64))
    }
}

/// Scale 16-bit little-endian samples so the loudest one hits full scale.
/// A trailing odd byte is kept as is.
fn normalize_pcm16(chunk: &[u8]) -> Bytes {
    let peak = chunk
        .chunks_exact(2)
        .map(|s| i16::from_le_bytes([s[0], s[1]]).unsigned_abs())
        .max()
        .unwrap_or(0);
    if peak == 0 {
        return Bytes::copy_from_slice(chunk);
    }

    let gain = i16::MAX as f32 / peak as f32;
    let mut out = Vec::with_capacity(chunk.len());
    for sample in chunk.chunks_exact(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]) as f32 * gain;
        let scaled = value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    out.extend_from_slice(chunk.chunks_exact(2).remainder());
    Bytes::from(out)
}
