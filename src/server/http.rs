//! HTTP server implementation
//!
//! hyper http1 with TokioIo; upgrades on /audio are handed to the
//! websocket module.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::Args;
use crate::coordinator::AudioPipeline;
use crate::routes;
use crate::server::websocket;
use crate::shutdown::ShutdownListener;
use crate::types::Result;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub pipeline: Arc<AudioPipeline>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, pipeline: Arc<AudioPipeline>) -> Self {
        Self {
            args,
            pipeline,
            started_at: Instant::now(),
        }
    }
}

/// Bind the configured address and serve until `shutdown` fires
pub async fn run(state: Arc<AppState>, shutdown: ShutdownListener) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    serve(listener, state, shutdown).await
}

/// Accept connections on an already bound listener
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: ShutdownListener,
) -> Result<()> {
    info!(
        "Audio gateway listening on {} as node {}",
        listener.local_addr()?,
        state.args.node_id
    );
    info!(
        "Inference backend {}, max {} clients",
        state.args.inference_server, state.args.max_clients
    );

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }

    info!("HTTP listener stopped");
    Ok(())
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/audio") if hyper_tungstenite::is_upgrade_request(&req) => {
            websocket::handle_audio_upgrade(state, addr, req)
        }
        (Method::GET, "/audio") => bad_request_response("Audio endpoint requires WebSocket upgrade"),

        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::health_check(&state),
        (Method::GET, "/ready") | (Method::GET, "/readyz") => routes::readiness_check(&state),
        (Method::GET, "/stats") => routes::stats(&state),
        (Method::GET, "/version") => routes::version_info(),

        _ => not_found_response(&path),
    };

    Ok(to_boxed(response))
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    routes::json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({
            "error": "Not Found",
            "path": path,
            "hint": "Stream audio over a WebSocket connection to /audio"
        }),
    )
}

fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    routes::json_response(
        StatusCode::BAD_REQUEST,
        &serde_json::json!({
            "error": "Bad Request",
            "message": message
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::StubInferenceClient;
    use crate::logging::EventLogger;
    use crate::shutdown::Shutdown;
    use clap::Parser;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start() -> (SocketAddr, Shutdown, tokio::task::JoinHandle<Result<()>>) {
        let args = Args::parse_from(["audio-gateway"]);
        let pipeline = AudioPipeline::start(
            Default::default(),
            Arc::new(StubInferenceClient::new("localhost:50051")),
            EventLogger::new("test-node"),
        )
        .await
        .unwrap();
        let state = Arc::new(AppState::new(args, pipeline));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(serve(listener, state, shutdown.subscribe()));
        (addr, shutdown, task)
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_routes() {
        let (addr, shutdown, task) = start().await;

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains("\"healthy\":true"));

        let stats = get(addr, "/stats").await;
        assert!(stats.starts_with("HTTP/1.1 200"));
        assert!(stats.contains("\"batches_emitted\":0"));

        let missing = get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        let plain = get(addr, "/audio").await;
        assert!(plain.starts_with("HTTP/1.1 400"));

        shutdown.trigger();
        task.await.unwrap().unwrap();
    }
}
