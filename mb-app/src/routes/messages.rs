use crate::server::{AppState, resolve_bot};
use axum::routing::post;
use axum::{Extension, Json};
use mb_channels::Recipient;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SendRequest {
    /// Roster name or bot identity.
    bot: String,
    /// Phone number/uuid, or `group:<id>`.
    recipient: String,
    message: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/messages/send", post(send_message))
}

#[tracing::instrument(level = "info", skip_all)]
async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> Json<serde_json::Value> {
    let bot = match resolve_bot(&state.roster, &req.bot) {
        Ok(bot) => bot,
        Err(e) => return Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    };
    let Some(recipient) = Recipient::parse(&req.recipient) else {
        return Json(serde_json::json!({ "status": "error", "error": "recipient is required" }));
    };

    match state.outbound.send_text(&bot, &recipient, &req.message).await {
        Ok(chunks) => Json(serde_json::json!({ "status": "ok", "chunks": chunks })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": format!("{e:#}") })),
    }
}
