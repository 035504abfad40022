use axum::extract::State;
use axum::Json;

use super::AppState;

/// `GET /health` -- liveness plus pool gauges.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let pool = match state.broker.pool().stats().await {
        Ok(stats) => serde_json::json!({
            "ready": stats.ready,
            "provisioning": stats.provisioning,
            "assigned": stats.assigned,
            "waiters": stats.waiters,
            "target": stats.target,
        }),
        Err(_) => serde_json::json!(null),
    };
    Json(serde_json::json!({
        "status": "ok",
        "pool": pool,
    }))
}
