use std::time::Duration;

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    // Bounded so the probe answers even when the first connection hangs.
    let store_ok = match tokio::time::timeout(Duration::from_secs(3), state.store.health_check())
        .await
    {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Health check store query failed");
            false
        }
        Err(_) => {
            tracing::error!("Health check store query timed out (3s)");
            false
        }
    };

    let status = if store_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "now": Utc::now().to_rfc3339(),
        "store": state.store.backend_tag(),
        "db": store_ok,
        "registry": state.compliance.connector_name(),
    }))
}
