//! Audio gateway server

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use audio_gateway::{
    config::Args,
    coordinator::AudioPipeline,
    inference::StubInferenceClient,
    logging::{self, EventLogger},
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init_tracing(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Audio Gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!(
        "Batching: {} chunks or {}ms, channel {}",
        args.batch_size, args.flush_timeout_ms, args.buffer_size
    );
    info!("Inference: {} ({}ms timeout)", args.inference_server, args.inference_timeout_ms);
    info!("Max clients: {}", args.max_clients);
    info!("======================================");

    let events = EventLogger::new(args.node_id.to_string());
    if let Some(path) = &args.event_log {
        match events.init_file(path).await {
            Ok(()) => info!("Event log: {}", path.display()),
            Err(e) => warn!("Event log {} unavailable, logging events to tracing only: {}", path.display(), e),
        }
    }

    let client = Arc::new(StubInferenceClient::new(args.inference_server.clone()));
    let pipeline = AudioPipeline::start(args.pipeline_config()?, client, events.clone()).await?;
    let state = Arc::new(AppState::new(args, Arc::clone(&pipeline)));

    let mut server = tokio::spawn(server::run(state, pipeline.shutdown_listener()));

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            None
        }
        // the server only returns on its own if it could not bind
        result = &mut server => Some(result),
    };

    pipeline.shutdown().await;
    events.flush().await;
    let outcome = match finished {
        Some(result) => result,
        None => server.await,
    };

    match outcome {
        Ok(Ok(())) => {
            info!("Audio gateway stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Server task failed: {}", e);
            Err(e.into())
        }
    }
}
