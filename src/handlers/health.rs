use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn version() -> Json<Value> {
    Json(json!({ "version": crate::VERSION }))
}

/// Static server-info entry with a live active-test count sourced from the
/// stream manager (SPEC_FULL.md supplemented feature, spec §6 `/api/v1/servers`).
pub async fn servers(State(state): State<AppState>) -> Json<Value> {
    let active = state.stream_manager.active_count().await;
    Json(json!({
        "servers": [
            {
                "name": "primary",
                "host": state.settings.server.host,
                "tcp_port": state.settings.server.tcp_port,
                "udp_port": state.settings.server.udp_port,
                "capacity_gbps": state.settings.capacity.capacity_gbps,
                "active_tests": active,
            }
        ]
    }))
}
