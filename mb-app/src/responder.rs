use anyhow::{Result, anyhow};
use async_trait::async_trait;
use mb_core::{ActivationRequest, InboundMessage, RoutedMessage};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything an agent needs to produce a reply for one activation.
#[derive(Debug, Clone, Serialize)]
pub struct ResponderRequest {
    pub activation: ActivationRequest,
    pub sender: String,
    pub sender_name: Option<String>,
    pub from_bot: bool,
    pub text: String,
}

impl ResponderRequest {
    pub fn new(activation: ActivationRequest, message: &InboundMessage, routed: &RoutedMessage) -> Self {
        Self {
            activation,
            sender: message.source_id.clone(),
            sender_name: message.source_name.clone(),
            from_bot: routed.from_bot,
            text: routed.history_text.clone(),
        }
    }
}

/// Agent runtime seam. `Ok(None)` means the agent chose not to reply.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &ResponderRequest) -> Result<Option<String>>;
}

/// Used when no agent endpoint is configured: activations are recorded but
/// nothing is sent back.
pub struct NoopResponder;

#[async_trait]
impl Responder for NoopResponder {
    async fn respond(&self, request: &ResponderRequest) -> Result<Option<String>> {
        tracing::debug!(
            bot_id = %request.activation.bot,
            agent_id = %request.activation.agent_id,
            "no responder configured; activation recorded only"
        );
        Ok(None)
    }
}

pub struct HttpResponder {
    http: reqwest::Client,
    url: Url,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponderReply {
    #[serde(default)]
    reply: Option<String>,
}

impl HttpResponder {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = normalize_http_url(url)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn respond(&self, request: &ResponderRequest) -> Result<Option<String>> {
        let mut builder = self.http.post(self.url.clone()).json(request);
        if let Some(token) = self.auth_token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "responder failed for agent {}: status={} body={}",
                request.activation.agent_id,
                status,
                body
            ));
        }
        parse_reply(&body)
    }
}

fn parse_reply(body: &str) -> Result<Option<String>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let reply: ResponderReply =
        serde_json::from_str(body).map_err(|e| anyhow!("invalid responder body: {e}"))?;
    Ok(reply
        .reply
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty()))
}

fn normalize_http_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("responder.url is required"));
    }
    let parsed = Url::parse(trimmed).map_err(|e| anyhow!("invalid responder.url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(anyhow!("invalid responder.url scheme: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use mb_core::{BotId, ResponseReason};

    fn request() -> ResponderRequest {
        let message = InboundMessage {
            source_id: "+15557777".to_string(),
            source_alias: None,
            source_name: Some("Dana".to_string()),
            conversation: "group-1".into(),
            is_group: true,
            receiving_bot: BotId::from("+15550001"),
            text: "@Scout status?".to_string(),
            mentions: vec![],
            quote: None,
            timestamp: 42,
            is_reprocessed: false,
        };
        let activation = ActivationRequest::new(
            BotId::from("+15550001"),
            "agent-scout",
            &message,
            ResponseReason::Mention,
        );
        ResponderRequest {
            activation,
            sender: message.source_id.clone(),
            sender_name: message.source_name.clone(),
            from_bot: false,
            text: "@Scout status?".to_string(),
        }
    }

    #[test]
    fn parse_reply_handles_empty_and_null_bodies() {
        assert_eq!(parse_reply("").expect("empty"), None);
        assert_eq!(parse_reply(r#"{"reply":null}"#).expect("null"), None);
        assert_eq!(parse_reply(r#"{"reply":"  "}"#).expect("blank"), None);
        assert_eq!(
            parse_reply(r#"{"reply":" all green "}"#).expect("reply"),
            Some("all green".to_string())
        );
        assert!(parse_reply("not json").is_err());
    }

    #[test]
    fn responder_url_must_be_http() {
        assert!(HttpResponder::new("ftp://agents.local", Duration::from_secs(1)).is_err());
        assert!(HttpResponder::new(" ", Duration::from_secs(1)).is_err());
        assert!(HttpResponder::new("http://127.0.0.1:9/reply", Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn http_responder_posts_activation_and_reads_reply() {
        let app = Router::new().route(
            "/reply",
            post(|Json(body): Json<serde_json::Value>| async move {
                let agent = body["activation"]["agent_id"].as_str().unwrap_or_default();
                let reason = body["activation"]["reason"].as_str().unwrap_or_default();
                Json(serde_json::json!({ "reply": format!("{agent} via {reason}") }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let responder =
            HttpResponder::new(&format!("http://{addr}/reply"), Duration::from_secs(5))
                .expect("responder");
        let reply = responder.respond(&request()).await.expect("respond");
        assert_eq!(reply.as_deref(), Some("agent-scout via mention"));
    }

    #[tokio::test]
    async fn noop_responder_never_replies() {
        assert_eq!(NoopResponder.respond(&request()).await.expect("noop"), None);
    }
}
