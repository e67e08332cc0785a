use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::middleware::{
    cors_middleware, rate_limit_middleware, request_id_middleware, security_headers_middleware,
    CorsConfig, RateLimitState,
};
use crate::{handlers, AppState};

/// `POST /api/v1/results` bodies are small JSON summaries (spec §6) — cap
/// well under axum's 2 MiB default so an oversized body is rejected with 413
/// before `Json<SaveResultRequest>` ever runs.
const RESULTS_BODY_LIMIT_BYTES: usize = 1024;

/// Builds the full router. Control flow per spec §2: logging -> security
/// headers -> CORS -> rate-limit (except `/download`, `/upload`, `/ping`) ->
/// route. Layers are added innermost-first, so the order below is reversed
/// relative to that description — the last `.layer()` call wraps outermost.
pub fn build(state: AppState) -> Router {
    let rate_limit_state = RateLimitState {
        limiter: Arc::clone(&state.rate_limiter),
        client_ip: Arc::clone(&state.client_ip),
    };

    let exempt = Router::new()
        .route("/api/v1/download", get(handlers::speedtest::download))
        .route("/api/v1/upload", post(handlers::speedtest::upload))
        .route("/api/v1/ping", get(handlers::speedtest::ping))
        .with_state(state.clone());

    let results_save = Router::new()
        .route("/api/v1/results", post(handlers::results::save))
        .layer(DefaultBodyLimit::max(RESULTS_BODY_LIMIT_BYTES))
        .with_state(state.clone());

    let limited = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api/v1/version", get(handlers::health::version))
        .route("/api/v1/servers", get(handlers::health::servers))
        .route("/api/v1/stream/start", post(handlers::stream::start))
        .route("/api/v1/stream/{id}/status", get(handlers::stream::status))
        .route("/api/v1/stream/{id}/results", get(handlers::stream::results))
        .route("/api/v1/stream/{id}/cancel", post(handlers::stream::cancel))
        .route("/api/v1/stream/{id}/metrics", post(handlers::stream::metrics))
        .route("/api/v1/stream/{id}/complete", post(handlers::stream::complete))
        .route("/api/v1/stream/{id}/stream", get(handlers::ws::upgrade))
        .route("/api/v1/results/{id}", get(handlers::results::get))
        .with_state(state.clone())
        .merge(results_save)
        .layer(axum::middleware::from_fn_with_state(
            rate_limit_state,
            rate_limit_middleware,
        ));

    let cors_config = Arc::new(CorsConfig::new(&state.settings.cors.allowed_origins));

    exempt
        .merge(limited)
        .layer(axum::middleware::from_fn_with_state(
            cors_config,
            cors_middleware,
        ))
        .layer(axum::middleware::from_fn(security_headers_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}
