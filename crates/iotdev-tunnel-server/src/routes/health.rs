//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// GET /health: liveness check with the number of open tunnels.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let open = state
        .tunnels
        .read()
        .await
        .values()
        .filter(|t| !t.is_closed())
        .count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "open_tunnels": open,
    }))
}
