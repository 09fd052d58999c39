use axum::{extract::State, Json};
use chrono::Utc;
use pollcast_core::{observability, AppState};
use serde_json::{json, Value};

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "nodeId": state.config.node_id,
        "bus": state.bus.backend_name(),
        "connections": state.registry.connection_count(),
        "metrics": observability::metrics_snapshot(),
    }))
}
