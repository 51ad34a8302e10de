//! Configuration for the audio gateway and the tuning client
//!
//! CLI arguments with environment variable fallbacks, using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::audio::BatcherConfig;
use crate::coordinator::PipelineConfig;
use crate::inference::PreprocessConfig;
use crate::pool::PoolConfig;
use crate::types::Result;

/// Audio gateway - batches streamed client audio for inference
#[derive(Parser, Debug, Clone)]
#[command(name = "audio-gateway")]
#[command(about = "WebSocket audio ingest with per-client batching and inference")]
#[command(version)]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Chunks per client before a batch is flushed
    #[arg(long, env = "BATCH_SIZE", default_value = "10")]
    pub batch_size: usize,

    /// Maximum time a chunk waits in a client buffer (milliseconds)
    #[arg(long, env = "FLUSH_TIMEOUT_MS", default_value = "2000")]
    pub flush_timeout_ms: u64,

    /// Maximum concurrent streaming sessions
    #[arg(long, env = "MAX_CLIENTS", default_value = "100")]
    pub max_clients: usize,

    /// Capacity of the batch channel in front of inference
    #[arg(long, env = "BUFFER_SIZE", default_value = "100")]
    pub buffer_size: usize,

    /// Inference server address
    #[arg(long, env = "INFERENCE_SERVER", default_value = "localhost:50051")]
    pub inference_server: String,

    /// Timeout for one inference call (milliseconds)
    #[arg(long, env = "INFERENCE_TIMEOUT_MS", default_value = "30000")]
    pub inference_timeout_ms: u64,

    /// Per-read timeout on streaming connections (seconds)
    #[arg(long, env = "READ_TIMEOUT_SECS", default_value = "60")]
    pub read_timeout_secs: u64,

    /// Preprocessing option as key=value (normalize, min_chunk_bytes, sample_rate_hz)
    #[arg(long = "preprocess", env = "PREPROCESS", value_delimiter = ',')]
    pub preprocess: Vec<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Append lifecycle events to this JSONL file
    #[arg(long, env = "EVENT_LOG")]
    pub event_log: Option<PathBuf>,
}

impl Args {
    /// Reject configurations that cannot produce a working gateway.
    /// Batching values of zero are defaulted later instead.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.inference_timeout_ms == 0 {
            return Err("INFERENCE_TIMEOUT_MS must be positive".to_string());
        }
        if self.read_timeout_secs == 0 {
            return Err("READ_TIMEOUT_SECS must be positive".to_string());
        }
        if self.max_clients == 0 {
            return Err("MAX_CLIENTS must be positive".to_string());
        }
        self.preprocess_config().map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            batch_size: self.batch_size,
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
            channel_capacity: self.buffer_size,
        }
        .validated()
    }

    pub fn preprocess_config(&self) -> Result<PreprocessConfig> {
        PreprocessConfig::from_pairs(&self.preprocess)
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        Ok(PipelineConfig {
            batcher: self.batcher_config(),
            preprocess: self.preprocess_config()?,
            inference_timeout: Duration::from_millis(self.inference_timeout_ms),
            max_clients: self.max_clients,
        })
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Tuning client - load generator for the audio gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "tuning-client")]
#[command(about = "Streams synthetic audio to the gateway, optionally through a connection pool")]
#[command(version)]
pub struct TuningArgs {
    /// Gateway WebSocket endpoint
    #[arg(long, env = "SERVER_URL", default_value = "ws://localhost:8080/audio")]
    pub server_url: String,

    /// Number of concurrent streaming clients
    #[arg(long, env = "CLIENT_COUNT", default_value = "3")]
    pub client_count: usize,

    /// Chunks each client sends
    #[arg(long, env = "CHUNKS_PER_CLIENT", default_value = "15")]
    pub chunks_per_client: usize,

    /// Delay between chunks (milliseconds)
    #[arg(long, env = "CHUNK_INTERVAL_MS", default_value = "100")]
    pub chunk_interval_ms: u64,

    /// Bytes per chunk
    #[arg(long, env = "CHUNK_SIZE", default_value = "1024")]
    pub chunk_size: usize,

    /// Upper bound on the whole run (seconds)
    #[arg(long, env = "TEST_DURATION_SECS", default_value = "10")]
    pub test_duration_secs: u64,

    /// Stream through the connection pool instead of one connection per client
    #[arg(long, env = "USE_CONNECTION_POOL", default_value = "true", action = clap::ArgAction::Set)]
    pub use_connection_pool: bool,

    /// Maximum pooled connections
    #[arg(long, env = "POOL_SIZE", default_value = "50")]
    pub pool_size: usize,

    /// Timeout for opening one connection (milliseconds)
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "10000")]
    pub connect_timeout_ms: u64,

    /// Idle pooled connections older than this are closed (seconds)
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value = "300")]
    pub idle_timeout_secs: u64,

    /// Maximum age of a pooled connection (seconds)
    #[arg(long, env = "MAX_LIFETIME_SECS", default_value = "1800")]
    pub max_lifetime_secs: u64,

    /// Pool cleanup period (seconds)
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value = "60")]
    pub cleanup_interval_secs: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl TuningArgs {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.server_url.trim().is_empty() {
            return Err("SERVER_URL must not be empty".to_string());
        }
        if self.client_count == 0 {
            return Err("CLIENT_COUNT must be positive".to_string());
        }
        if self.chunk_size < 4 {
            return Err("CHUNK_SIZE must be at least 4 bytes".to_string());
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_pool_size: self.pool_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            server_url: self.server_url.clone(),
        }
        .validated()
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let args = Args::parse_from(["audio-gateway"]);
        assert_eq!(args.listen.port(), 8080);
        assert!(args.validate().is_ok());

        let batcher = args.batcher_config();
        assert_eq!(batcher.batch_size, 10);
        assert_eq!(batcher.flush_timeout, Duration::from_secs(2));
        assert_eq!(batcher.channel_capacity, 100);
        assert_eq!(args.read_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_batch_values_are_defaulted() {
        let args = Args::parse_from(["audio-gateway", "--batch-size", "0", "--flush-timeout-ms", "0"]);
        assert!(args.validate().is_ok());
        let batcher = args.batcher_config();
        assert_eq!(batcher.batch_size, 10);
        assert_eq!(batcher.flush_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_unusable_config_is_rejected() {
        let args = Args::parse_from(["audio-gateway", "--inference-timeout-ms", "0"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(["audio-gateway", "--preprocess", "reverb=on"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_preprocess_options() {
        let args = Args::parse_from([
            "audio-gateway",
            "--preprocess",
            "normalize=true,min_chunk_bytes=64",
        ]);
        let config = args.pipeline_config().unwrap();
        assert!(config.preprocess.normalize);
        assert_eq!(config.preprocess.min_chunk_bytes, 64);
    }

    #[test]
    fn test_tuning_defaults() {
        let args = TuningArgs::parse_from(["tuning-client"]);
        assert!(args.validate().is_ok());
        assert!(args.use_connection_pool);
        assert_eq!(args.client_count, 3);

        let pool = args.pool_config();
        assert_eq!(pool.max_pool_size, 50);
        assert_eq!(pool.connect_timeout, Duration::from_secs(10));
        assert_eq!(pool.server_url, "ws://localhost:8080/audio");

        let args = TuningArgs::parse_from(["tuning-client", "--use-connection-pool", "false"]);
        assert!(!args.use_connection_pool);
    }
}
