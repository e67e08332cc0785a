use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::AppError;
use crate::handlers::resolve_client_ip;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    duration: u64,
    chunk: usize,
}

const CHUNK_FLUSH_CADENCE: usize = 8;

/// Increments `counter`; if the post-increment value exceeds `cap`,
/// decrements back and returns `false` (spec §4.4 "admission", shared by
/// download and upload).
fn try_admit(counter: &Arc<AtomicU32>, cap: u32) -> bool {
    let prev = counter.fetch_add(1, Ordering::SeqCst);
    if prev + 1 > cap {
        counter.fetch_sub(1, Ordering::SeqCst);
        false
    } else {
        true
    }
}

/// Decrements the admission counter when dropped — covers both normal
/// stream completion and a client disconnecting mid-stream (spec §8
/// property 10, "cancellable HTTP streaming").
struct AdmissionGuard(Arc<AtomicU32>);

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exhausts and discards a request body before an early-return error
/// response (spec §4.4) so a slow or oversized client body never pairs with
/// a premature response on the same connection.
async fn drain_body(body: Body) {
    let _ = axum::body::to_bytes(body, 16 * 1024 * 1024).await;
}

pub async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
    request: axum::extract::Request,
) -> Response {
    // Admission is checked before parameter validation (spec §9: "increments
    // the counter before parameter validation") — a capacity-exceeded request
    // never reaches the duration/chunk checks below.
    if !try_admit(&state.active_downloads, state.settings.capacity.max_concurrent_http) {
        drain_body(request.into_body()).await;
        return AppError::ResourceExhausted("active downloads at capacity".to_string())
            .into_response();
    }
    let guard = AdmissionGuard(Arc::clone(&state.active_downloads));

    let max_duration = state.settings.speedtest.max_download_duration.as_secs();
    if params.duration == 0 || params.duration > max_duration {
        drop(guard);
        drain_body(request.into_body()).await;
        return AppError::InvalidConfig(format!("duration must be in 1..={max_duration}"))
            .into_response();
    }
    let (min_chunk, max_chunk) = (
        state.settings.speedtest.min_chunk_bytes,
        state.settings.speedtest.max_chunk_bytes,
    );
    if !(min_chunk..=max_chunk).contains(&params.chunk) {
        drop(guard);
        drain_body(request.into_body()).await;
        return AppError::InvalidConfig(format!("chunk must be in {min_chunk}..={max_chunk}"))
            .into_response();
    }

    drop(request);
    let payload = state.download_payload.clone();
    let chunk_size = params.chunk;
    let deadline = Instant::now() + Duration::from_secs(params.duration);

    let body_stream = stream::unfold(
        (payload, 0usize, guard, 0u32),
        move |(payload, offset, guard, writes)| async move {
            if Instant::now() >= deadline {
                return None;
            }
            let mut chunk = vec![0u8; chunk_size];
            payload.fill_slice(offset, &mut chunk);
            let next_offset = offset.wrapping_add(chunk_size);
            let writes = writes + 1;
            if writes as usize % CHUNK_FLUSH_CADENCE == 0 {
                tokio::task::yield_now().await;
            }
            Some((
                Ok::<_, std::io::Error>(Bytes::from(chunk)),
                (payload, next_offset, guard, writes),
            ))
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

#[derive(serde::Serialize)]
struct UploadResponse {
    bytes: u64,
    duration_ms: u64,
    throughput_mbps: f64,
}

pub async fn upload(State(state): State<AppState>, request: axum::extract::Request) -> Response {
    if !try_admit(&state.active_uploads, state.settings.capacity.max_concurrent_http) {
        drain_body(request.into_body()).await;
        return AppError::ResourceExhausted("active uploads at capacity".to_string())
            .into_response();
    }
    let _guard = AdmissionGuard(Arc::clone(&state.active_uploads));

    let max_duration = state.settings.speedtest.max_upload_duration;
    let deadline = Instant::now() + max_duration;
    let start = Instant::now();

    let mut body_stream = request.into_body().into_data_stream();
    let mut total_bytes: u64 = 0;

    loop {
        if Instant::now() >= deadline {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, futures::StreamExt::next(&mut body_stream)).await {
            Ok(Some(Ok(chunk))) => {
                total_bytes += chunk.len() as u64;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "upload read error");
                return AppError::ConnectionFailed(e.to_string()).into_response();
            }
            Ok(None) => break, // EOF
            Err(_) => break,   // deadline elapsed
        }
    }

    let elapsed = start.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;
    let throughput_mbps = if elapsed.as_secs_f64() > 0.0 {
        (total_bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0
    } else {
        0.0
    };

    Json(UploadResponse {
        bytes: total_bytes,
        duration_ms: elapsed_ms,
        throughput_mbps,
    })
    .into_response()
}

pub async fn ping(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client_ip = resolve_client_ip(&state, Some(peer), &headers);
    let ipv6 = client_ip.parse::<std::net::Ipv6Addr>().is_ok();
    let timestamp = chrono::Utc::now().timestamp_millis();

    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(json!({
            "pong": true,
            "timestamp": timestamp,
            "client_ip": client_ip,
            "ipv6": ipv6,
        })),
    )
        .into_response()
}
