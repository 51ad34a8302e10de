//! Tuning client - load generator for the audio gateway
//!
//! Usage:
//!   tuning-client --server-url ws://localhost:8080/audio --client-count 10
//!
//! Environment variables:
//!   SERVER_URL - gateway endpoint (default: ws://localhost:8080/audio)
//!   CLIENT_COUNT - concurrent clients (default: 3)
//!   CHUNKS_PER_CLIENT - chunks per client (default: 15)
//!   USE_CONNECTION_POOL - borrow connections from a pool (default: true)
//!   POOL_SIZE - maximum pooled connections (default: 50)

use clap::Parser;
use tracing::{error, info};

use audio_gateway::{config::TuningArgs, logging, shutdown::Shutdown, tuning};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = TuningArgs::parse();
    logging::init_tracing(&args.log_level, false);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("Server URL: {}", args.server_url);
    info!(
        "Clients: {} x {} chunks of {} bytes every {}ms (max {}s)",
        args.client_count,
        args.chunks_per_client,
        args.chunk_size,
        args.chunk_interval_ms,
        args.test_duration_secs
    );
    if args.use_connection_pool {
        info!(
            "Connection pool: size {}, connect timeout {}ms, idle timeout {}s",
            args.pool_size, args.connect_timeout_ms, args.idle_timeout_secs
        );
    } else {
        info!("Connection pool disabled, one connection per client");
    }

    let shutdown = Shutdown::new();
    let listener = shutdown.subscribe();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping clients");
            shutdown.trigger();
        }
    });

    let report = tuning::run_load_test(args, listener).await?;

    println!("\nLoad test summary");
    println!("=================");
    println!("{}", report);
    Ok(())
}
