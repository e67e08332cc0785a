use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Origin allow-list matcher: exact case-insensitive host match, or a
/// `*.suffix` wildcard requiring a dot boundary (so `evilexample.com` does
/// not match `*.example.com`), or a bare `*` allowing any origin (spec §6
/// "CORS").
#[derive(Debug, Clone)]
pub struct CorsConfig {
    allow_all: bool,
    allowed: Vec<String>,
}

impl CorsConfig {
    pub fn new(allowed_origins: &[String]) -> Self {
        let allow_all = allowed_origins.iter().any(|o| o == "*");
        Self {
            allow_all,
            allowed: allowed_origins
                .iter()
                .filter(|o| o.as_str() != "*")
                .map(|o| o.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        if self.allow_all {
            return true;
        }
        let origin = origin.to_ascii_lowercase();
        let host = strip_scheme(&origin);
        self.allowed.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host.ends_with(suffix) && host.len() > suffix.len() && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            } else {
                let pattern_host = strip_scheme(pattern);
                host == pattern_host || origin == *pattern
            }
        })
    }
}

fn strip_scheme(s: &str) -> &str {
    s.split("://").last().unwrap_or(s)
}

/// Custom CORS middleware matching spec §6 exactly: tower-http's `CorsLayer`
/// cannot express "disallowed preflight origin -> 403" (it just omits the
/// ACAO header), so this is hand-rolled the way the teacher hand-rolls its
/// other `from_fn` middleware (see `request_id.rs`, `security_headers.rs`).
pub async fn cors_middleware(
    State(config): State<Arc<CorsConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let is_preflight = request.method() == Method::OPTIONS
        && request
            .headers()
            .contains_key(axum::http::header::ACCESS_CONTROL_REQUEST_METHOD);

    let Some(origin) = origin else {
        return next.run(request).await;
    };

    if !config.is_allowed(&origin) {
        if is_preflight {
            return StatusCode::FORBIDDEN.into_response();
        }
        return next.run(request).await;
    }

    let mut response = if is_preflight {
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(axum::body::Body::empty())
            .unwrap()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    let acao_value = if config.allow_all {
        HeaderValue::from_static("*")
    } else {
        HeaderValue::from_str(&origin).unwrap_or_else(|_| HeaderValue::from_static("null"))
    };
    headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, acao_value);
    if !config.allow_all {
        headers.insert(axum::http::header::VARY, HeaderValue::from_static("Origin"));
    }
    if is_preflight {
        headers.insert(
            axum::http::header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("content-type"),
        );
        headers.insert(
            axum::http::header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("600"),
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_matches_case_insensitively() {
        let cfg = CorsConfig::new(&["https://Example.com".to_string()]);
        assert!(cfg.is_allowed("https://example.COM"));
    }

    #[test]
    fn wildcard_requires_dot_boundary() {
        let cfg = CorsConfig::new(&["*.example.com".to_string()]);
        assert!(cfg.is_allowed("https://sub.example.com"));
        assert!(!cfg.is_allowed("https://evilexample.com"));
    }

    #[test]
    fn star_allows_any_origin() {
        let cfg = CorsConfig::new(&["*".to_string()]);
        assert!(cfg.is_allowed("https://anything.test"));
    }

    #[test]
    fn unmatched_origin_is_denied() {
        let cfg = CorsConfig::new(&["https://example.com".to_string()]);
        assert!(!cfg.is_allowed("https://other.test"));
    }
}
