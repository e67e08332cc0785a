use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable row persisted by the results store (spec §3 "Saved result").
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SavedResult {
    pub id: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loaded_latency_ms: f64,
    pub bufferbloat_grade: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub server_name: String,
    pub created_at: DateTime<Utc>,
}

/// Body accepted by `POST /api/v1/results`. Unknown fields are rejected by
/// `serde(deny_unknown_fields)` per spec §6.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveResultRequest {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loaded_latency_ms: f64,
    pub bufferbloat_grade: String,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    pub server_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveResultResponse {
    pub id: String,
    pub url: String,
}
