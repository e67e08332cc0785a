use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

const CSP: &str = "default-src 'self'; script-src 'self'; style-src 'self'; connect-src 'self' https: http: ws: wss:";

/// Sets the fixed security headers required on every response (spec §6
/// "Headers"): `X-Content-Type-Options`, `X-Frame-Options`, `Referrer-Policy`,
/// and a self-origin CSP that still allows the WebSocket/HTTP test traffic
/// this service itself generates.
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(CSP),
    );
    response
}
