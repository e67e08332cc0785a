use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::AppError;
use crate::models::SaveResultRequest;
use crate::services::SavedResultInput;
use crate::AppState;

pub async fn save(State(state): State<AppState>, Json(body): Json<SaveResultRequest>) -> Response {
    let input = SavedResultInput {
        download_mbps: body.download_mbps,
        upload_mbps: body.upload_mbps,
        latency_ms: body.latency_ms,
        jitter_ms: body.jitter_ms,
        loaded_latency_ms: body.loaded_latency_ms,
        bufferbloat_grade: body.bufferbloat_grade,
        ipv4: body.ipv4,
        ipv6: body.ipv6,
        server_name: body.server_name,
    };

    match state.results_store.save(&input).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(crate::models::SaveResultResponse {
                url: format!("/api/v1/results/{id}"),
                id,
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if id.len() != 8 || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return AppError::InvalidConfig("result id must be 8 alphanumeric characters".to_string())
            .into_response();
    }

    match state.results_store.get(&id).await {
        Ok(Some(result)) => Json(result).into_response(),
        Ok(None) => AppError::NotFound(format!("result {id}")).into_response(),
        Err(e) => e.into_response(),
    }
}
