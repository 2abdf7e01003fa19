use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use mb_core::ConnectionState;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let links = state.reconnect.snapshot();
    let failed: Vec<String> = links
        .iter()
        .filter(|link| link.state == ConnectionState::Failed)
        .map(|link| link.bot.to_string())
        .collect();
    let connected = links
        .iter()
        .filter(|link| link.state == ConnectionState::Connected)
        .count();
    let consistency = state.checker.stats();

    let status = if !failed.is_empty() {
        "degraded"
    } else if connected == state.roster.len() {
        "ok"
    } else {
        "connecting"
    };

    Json(serde_json::json!({
        "status": status,
        "ready": failed.is_empty() && connected > 0,
        "checked_at": Utc::now(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "checks": {
            "bots": links,
            "failed_bots": failed,
            "dedup_tracked": state.dedup.len(),
            "consistency": {
                "pending": consistency.pending,
                "evaluated": consistency.evaluated,
                "repairs_requested": consistency.repairs_requested,
            }
        }
    }))
}
