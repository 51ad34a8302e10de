//! Health, stats and version endpoints
//!
//! - /health, /healthz - liveness, always 200 while the process runs
//! - /ready, /readyz - 503 when the inference backend is disconnected or
//!   the session limit is reached
//! - /stats - batcher and session counters
//! - /version - build information

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    /// "online" or "degraded"
    pub status: &'static str,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub node_id: String,
    pub timestamp: String,
    pub sessions: SessionHealth,
    pub inference: InferenceHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct SessionHealth {
    pub active: usize,
    pub max: usize,
}

#[derive(Serialize)]
pub struct InferenceHealth {
    pub connected: bool,
    pub server: String,
    pub status: String,
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub name: &'static str,
    pub version: &'static str,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let pipeline_stats = state.pipeline.stats();
    let connected = state.pipeline.inference_connected();
    let at_capacity = state.pipeline.sessions().is_at_capacity();

    let error = if !connected {
        Some(format!(
            "Inference backend {} is not connected",
            state.args.inference_server
        ))
    } else if at_capacity {
        Some(format!(
            "Session limit reached ({} of {})",
            pipeline_stats.sessions, pipeline_stats.max_sessions
        ))
    } else {
        None
    };

    HealthResponse {
        healthy: true,
        status: if error.is_none() { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        node_id: state.args.node_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        sessions: SessionHealth {
            active: pipeline_stats.sessions,
            max: pipeline_stats.max_sessions,
        },
        inference: InferenceHealth {
            connected,
            server: state.args.inference_server.clone(),
            status: pipeline_stats.inference_status,
        },
        error,
    }
}

/// Serialize `value` into a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("Serialization failed: {e}") })
                .to_string()
                .into_bytes(),
        ),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Liveness probe (/health, /healthz)
pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &build_health_response(state))
}

/// Readiness probe (/ready, /readyz)
pub fn readiness_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = build_health_response(state);
    let status = if response.error.is_none() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &response)
}

/// Pipeline counters (/stats)
pub fn stats(state: &AppState) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &state.pipeline.stats())
}

/// Build information (/version)
pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &VersionResponse {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::coordinator::{AudioPipeline, PipelineConfig};
    use crate::inference::StubInferenceClient;
    use crate::logging::EventLogger;
    use clap::Parser;
    use http_body_util::BodyExt;
    use std::sync::Arc;

    async fn state(max_clients: usize) -> AppState {
        let args = Args::parse_from(["audio-gateway"]);
        let config = PipelineConfig {
            max_clients,
            ..PipelineConfig::default()
        };
        let pipeline = AudioPipeline::start(
            config,
            Arc::new(StubInferenceClient::new(args.inference_server.clone())),
            EventLogger::new("test-node"),
        )
        .await
        .unwrap();
        AppState::new(args, pipeline)
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_online() {
        let state = state(2).await;
        let response = health_check(&state);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = body_json(response).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["status"], "online");
        assert_eq!(body["inference"]["connected"], true);
        assert_eq!(body["sessions"]["max"], 2);
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_readiness_fails_at_session_limit() {
        let state = state(1).await;
        state.pipeline.register_client("c1", None).unwrap();

        let response = readiness_check(&state);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        // liveness is unaffected
        assert_eq!(health_check(&state).status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_fails_after_shutdown() {
        let state = state(1).await;
        state.pipeline.shutdown().await;

        let body = body_json(readiness_check(&state)).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["inference"]["connected"], false);
    }

    #[tokio::test]
    async fn test_version_info() {
        let body = body_json(version_info()).await;
        assert_eq!(body["name"], "audio-gateway");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
