//! Audio WebSocket sessions
//!
//! A client upgrades on `/audio`, identifying itself with `X-Client-ID`.
//! Binary frames are audio chunks fed to the batcher; inference results for
//! the same client id come back as JSON text frames. The session ends on a
//! close frame, a read timeout, or pipeline shutdown.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use hyper_tungstenite::tungstenite::protocol::CloseFrame;
use hyper_tungstenite::tungstenite::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::routes::json_response;
use crate::server::http::AppState;
use crate::session::{ClientSession, UNKNOWN_CLIENT};
use crate::types::GatewayError;

/// Header carrying the client id
pub const CLIENT_ID_HEADER: &str = "x-client-id";

type AudioSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Register the session and upgrade. Refuses with 503 when the session
/// limit is reached.
pub fn handle_audio_upgrade(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let client_id = req
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string();

    let session = match state.pipeline.register_client(&client_id, Some(addr)) {
        Ok(session) => session,
        Err(e) => {
            warn!("Refusing audio connection from {} ({}): {}", addr, client_id, e);
            return error_response(e);
        }
    };

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            warn!("Audio: WebSocket upgrade failed for {}: {}", addr, e);
            state.pipeline.unregister_client(&session.session_id);
            return error_response(GatewayError::WebSocket(format!(
                "WebSocket upgrade failed: {e}"
            )));
        }
    };

    info!(
        "Audio session {} opened for {} from {}",
        session.session_id, session.client_id, addr
    );

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => run_session(&state, &session, ws).await,
            Err(e) => warn!("Audio: WebSocket connection failed: {}", e),
        }
        state.pipeline.unregister_client(&session.session_id);
        info!(
            "Audio session {} closed for {}",
            session.session_id, session.client_id
        );
    });

    response.map(|_| Full::new(Bytes::new()))
}

fn error_response(err: GatewayError) -> Response<Full<Bytes>> {
    let (status, message) = err.into_status_code_and_body();
    json_response(status, &serde_json::json!({ "error": message }))
}

async fn run_session(state: &AppState, session: &ClientSession, ws: AudioSocket) {
    let (mut write, mut read) = ws.split();
    let mut results = state.pipeline.subscribe_results();
    let mut shutdown = state.pipeline.shutdown_listener();
    let read_timeout = state.args.read_timeout();
    let mut read_deadline = Instant::now() + read_timeout;
    let client_id = session.client_id.as_str();

    let close_reason = loop {
        tokio::select! {
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("Audio: read error for {}: {}", client_id, e);
                        break None;
                    }
                    None => break None,
                };
                read_deadline = Instant::now() + read_timeout;

                match msg {
                    Message::Binary(data) => {
                        match state.pipeline.process_audio_data(client_id, Bytes::from(data)) {
                            Ok(()) => {}
                            Err(e @ GatewayError::ChannelSaturated { .. }) => {
                                warn!("Audio: {}", e);
                            }
                            Err(e) => {
                                warn!("Audio: rejecting chunk from {}: {}", client_id, e);
                                break Some("server shutting down");
                            }
                        }
                    }
                    Message::Close(_) => break None,
                    Message::Text(_) => debug!("Audio: ignoring text frame from {}", client_id),
                    _ => {}
                }
            }
            result = results.recv() => match result {
                Ok(result) if result.client_id == client_id => {
                    let payload = match serde_json::to_string(&result) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Audio: failed to encode result: {}", e);
                            continue;
                        }
                    };
                    if write.send(Message::Text(payload)).await.is_err() {
                        break None;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Audio: {} missed {} results", client_id, skipped);
                }
                Err(RecvError::Closed) => break Some("server shutting down"),
            },
            _ = tokio::time::sleep_until(read_deadline) => {
                info!("Audio: read timeout for {} after {:?}", client_id, read_timeout);
                break Some("read timeout");
            }
            _ = shutdown.cancelled() => break Some("server shutting down"),
        }
    };

    if let Some(reason) = close_reason {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        };
        if let Err(e) = write.send(Message::Close(Some(frame))).await {
            debug!("Audio: failed to send close frame to {}: {}", client_id, e);
        }
    }
    let _ = write.close().await;
}
