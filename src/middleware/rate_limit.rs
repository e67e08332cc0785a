use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::services::{Admission, ClientIpResolver, RateLimiter};

/// Shared state for the rate-limit middleware: the dual token-bucket
/// limiter plus the client-IP resolver it admits against (spec §4.2, §4.1).
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub client_ip: Arc<ClientIpResolver>,
}

/// Applied to every route except `/download`, `/upload`, `/ping` (spec §2
/// control flow — those three manage their own admission caps instead).
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let forwarded_for = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let real_ip = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok());

    let ip = state.client_ip.resolve(Some(peer), forwarded_for, real_ip);

    match state.limiter.admit(&ip).await {
        Admission::Admitted => next.run(request).await,
        Admission::DeniedPerIp | Admission::DeniedGlobal => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "1")],
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response(),
    }
}
