use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;

/// Liveness plus a cheap readiness probe of both stores. Degraded stores
/// still answer 200 with per-store detail; orchestration decides what to do
/// with it.
pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let config_db = match state.config_db.list_tenants() {
        Ok(_) => "ok",
        Err(_) => "unavailable",
    };
    let day = state.clock.now().format("%Y-%m-%d").to_string();
    let telemetry_store = match state.telemetry_store.count_today("health", &day).await {
        Ok(_) => "ok",
        Err(_) => "unavailable",
    };
    Json(json!({
        "status": if config_db == "ok" && telemetry_store == "ok" { "ok" } else { "degraded" },
        "config_db": config_db,
        "telemetry_store": telemetry_store,
    }))
}
