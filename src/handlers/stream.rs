use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;

use crate::error::AppError;
use crate::handlers::resolve_client_ip;
use crate::models::{Direction, MetricsSnapshot, Protocol, StreamConfig, StreamMode, StreamStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StartStreamRequest {
    protocol: Protocol,
    direction: Direction,
    duration: u64,
    streams: u32,
    packet_size: u32,
    #[serde(default)]
    mode: Option<StreamMode>,
}

#[derive(Debug, Serialize)]
pub struct StartStreamResponse {
    stream_id: String,
    websocket_url: String,
    status: StreamStatus,
    mode: StreamMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_server_tcp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_server_udp: Option<String>,
}

pub async fn start(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<StartStreamRequest>,
) -> Response {
    let client_ip = resolve_client_ip(&state, Some(peer), &headers);
    let mode = body.mode.unwrap_or_default();

    let config = match StreamConfig::new(
        None,
        body.protocol,
        body.direction,
        body.duration,
        body.streams,
        body.packet_size,
        client_ip,
        mode,
        state.settings.transport.max_test_duration,
        state.settings.stream_manager.max_parallel_streams,
    ) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    let stream_id = config.id.clone();
    if let Err(e) = state.stream_manager.create_stream(config).await {
        return e.into_response();
    }
    let started = match state.stream_manager.start_stream(&stream_id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let (test_server_tcp, test_server_udp) = match mode {
        StreamMode::Proxy => (
            Some(format!(
                "{}:{}",
                state.settings.server.host, state.settings.server.tcp_port
            )),
            Some(format!(
                "{}:{}",
                state.settings.server.host, state.settings.server.udp_port
            )),
        ),
        StreamMode::Client => (None, None),
    };

    (
        StatusCode::CREATED,
        Json(StartStreamResponse {
            stream_id: stream_id.clone(),
            websocket_url: format!("/api/v1/stream/{stream_id}/stream"),
            status: started.status,
            mode,
            test_server_tcp,
            test_server_udp,
        }),
    )
        .into_response()
}

pub async fn status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.stream_manager.get(&id).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn results(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.stream_manager.get(&id).await {
        Ok(s) if s.status.is_terminal() => Json(s).into_response(),
        Ok(s) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": s.status, "progress": s.progress })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.stream_manager.cancel_stream(&id).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MetricsSnapshot>,
) -> Response {
    match state.stream_manager.update_metrics(&id, body).await {
        Ok(s) => (StatusCode::ACCEPTED, Json(s)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CompleteRequest {
    Completed { metrics: MetricsSnapshot },
    Failed { metrics: Option<MetricsSnapshot> },
}

pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Response {
    let result = match body {
        CompleteRequest::Completed { metrics } => {
            state.stream_manager.complete_stream(&id, metrics).await
        }
        CompleteRequest::Failed { metrics } => {
            state
                .stream_manager
                .fail_stream(&id, metrics, "client reported failure".to_string())
                .await
        }
    };

    match result {
        Ok(s) => Json(s).into_response(),
        Err(e) => e.into_response(),
    }
}
