pub mod health;
pub mod results;
pub mod speedtest;
pub mod stream;
pub mod ws;

/// Resolve the requesting client's IP the same way the rate-limit middleware
/// does, for handlers (ping, stream create) that need it directly rather
/// than through request extensions.
pub(crate) fn resolve_client_ip(
    state: &crate::AppState,
    peer: Option<std::net::SocketAddr>,
    headers: &axum::http::HeaderMap,
) -> String {
    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    state.client_ip.resolve(peer, forwarded_for, real_ip)
}
