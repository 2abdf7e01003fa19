use crate::traits::{Recipient, SignalSend, SignalTransport};
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use mb_core::{BotId, InboundMessage, Mention, Quote};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for a signal-cli REST gateway shared by every bot account.
#[derive(Clone)]
pub struct SignalClient {
    http: reqwest::Client,
    api_base_url: String,
    api_token: Option<String>,
    ws_base_url: Option<String>,
    // (account, inbound group id) -> sendable group id
    groups: Arc<DashMap<(String, String), String>>,
}

impl SignalClient {
    pub fn new(api_base_url: &str, request_timeout: Duration) -> Result<Self> {
        let api_base_url = normalize_signal_api_base_url(api_base_url)?;
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            api_base_url,
            api_token: None,
            ws_base_url: None,
            groups: Arc::new(DashMap::new()),
        })
    }

    pub fn with_api_token(mut self, api_token: Option<String>) -> Self {
        self.api_token = api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    /// Overrides the websocket base derived from the REST base URL.
    pub fn with_ws_base_url(mut self, ws_base_url: Option<String>) -> Self {
        self.ws_base_url = ws_base_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/'))
            .filter(|url| !url.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.api_base_url, path))
            .map_err(|e| anyhow!("invalid signal API URL path {path:?}: {e}"))
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Websocket endpoint streaming envelopes for `account`.
    pub fn receive_url(&self, account: &str) -> Result<String> {
        receive_url_for(
            self.ws_base_url.as_deref().unwrap_or(&self.api_base_url),
            account,
        )
    }

    pub async fn fetch_groups(&self, account: &str) -> Result<Vec<SignalGroup>> {
        let url = self.api_url(&format!("/v1/groups/{account}"))?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(anyhow!(
                "signal group listing failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(response.json().await?)
    }

    /// Checks that the gateway answers at all.
    pub async fn probe(&self) -> Result<()> {
        let url = self.api_url("/v1/about")?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("signal gateway probe failed: status={status}"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SignalTransport for SignalClient {
    async fn send(&self, bot: &BotId, request: &SignalSend) -> Result<()> {
        let text = request.message.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.api_url("/v2/send")?;
        let payload = build_send_payload(bot.as_str(), request);
        let response = self
            .authorized_request(self.http.post(url))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "signal send failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }

    async fn resolve_group(&self, bot: &BotId, group_id: &str) -> Result<String> {
        // Already in sendable form.
        if group_id.starts_with("group.") {
            return Ok(group_id.to_string());
        }
        let cache_key = (bot.to_string(), group_id.to_string());
        if let Some(resolved) = self.groups.get(&cache_key) {
            return Ok(resolved.clone());
        }

        let groups = self.fetch_groups(bot.as_str()).await?;
        for group in groups {
            if group.internal_id.is_empty() || group.id.is_empty() {
                continue;
            }
            self.groups
                .insert((bot.to_string(), group.internal_id), group.id);
        }
        self.groups
            .get(&cache_key)
            .map(|resolved| resolved.clone())
            .ok_or_else(|| anyhow!("signal group {group_id} is not known to account {bot}"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignalGroup {
    pub id: String,
    pub internal_id: String,
    pub name: Option<String>,
}

fn build_send_payload(account: &str, request: &SignalSend) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "number": account,
        "message": request.message,
    });
    payload["recipients"] = match &request.recipient {
        Recipient::Direct(recipient) => serde_json::json!([recipient]),
        Recipient::Group(group_id) => serde_json::json!([group_id]),
    };
    if !request.mentions.is_empty() {
        payload["mentions"] = serde_json::json!(request.mentions);
    }
    payload
}

fn normalize_signal_api_base_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("signal api_base_url is required"));
    }
    let parsed =
        Url::parse(&normalized).map_err(|e| anyhow!("invalid signal api_base_url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!(
            "invalid signal api_base_url scheme: {other} (expected http or https)"
        )),
    }
}

fn receive_url_for(api_base_url: &str, account: &str) -> Result<String> {
    let account = account.trim();
    if account.is_empty() {
        return Err(anyhow!("signal account is required"));
    }
    let ws_base = if let Some(rest) = api_base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if api_base_url.starts_with("ws://") || api_base_url.starts_with("wss://") {
        api_base_url.to_string()
    } else {
        return Err(anyhow!("invalid signal api_base_url: {api_base_url}"));
    };
    Ok(format!("{ws_base}/v1/receive/{account}"))
}

pub(crate) fn parse_signal_receive_payload(body: serde_json::Value) -> Vec<SignalEnvelope> {
    match body {
        serde_json::Value::Array(values) => values
            .into_iter()
            .filter_map(extract_signal_envelope)
            .collect(),
        serde_json::Value::Object(mut map) => {
            // JSON-RPC notification frames wrap the envelope in `params`.
            if let Some(params) = map.remove("params") {
                return parse_signal_receive_payload(params);
            }
            if let Some(messages) = map.get("messages").and_then(|value| value.as_array()) {
                return messages
                    .iter()
                    .cloned()
                    .filter_map(extract_signal_envelope)
                    .collect();
            }
            extract_signal_envelope(serde_json::Value::Object(map))
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

fn extract_signal_envelope(raw: serde_json::Value) -> Option<SignalEnvelope> {
    let envelope_value = if let Some(envelope) = raw.get("envelope") {
        envelope.clone()
    } else {
        raw
    };
    match serde_json::from_value(envelope_value) {
        Ok(envelope) => Some(envelope),
        Err(error) => {
            tracing::warn!(%error, "ignoring undecodable signal envelope");
            None
        }
    }
}

fn envelope_timestamp_millis(envelope: &SignalEnvelope) -> Option<i64> {
    envelope
        .data_message
        .as_ref()
        .and_then(|message| message.timestamp)
        .or(envelope.timestamp)
}

/// Converts an envelope observed on `receiving_bot`'s feed. Receipts, typing
/// notices and other non-message envelopes yield `None`.
pub(crate) fn convert_signal_envelope(
    envelope: &SignalEnvelope,
    receiving_bot: &BotId,
) -> Option<InboundMessage> {
    let data_message = envelope.data_message.as_ref()?;
    let Some(source_id) = envelope_sender_id(envelope) else {
        tracing::warn!(bot_id = %receiving_bot, "signal data message without a source; dropping");
        return None;
    };
    let Some(timestamp) = envelope_timestamp_millis(envelope) else {
        tracing::warn!(bot_id = %receiving_bot, "signal data message without a timestamp; dropping");
        return None;
    };

    let text = data_message.message.as_deref().unwrap_or_default();
    let mentions: Vec<Mention> = data_message
        .mentions
        .iter()
        .filter_map(SignalMention::to_mention)
        .collect();
    if text.trim().is_empty() && mentions.is_empty() {
        tracing::debug!(bot_id = %receiving_bot, "signal data message without text; ignoring");
        return None;
    }

    let group_id = envelope_group_id(envelope);
    let source_alias = envelope
        .source_uuid
        .as_deref()
        .map(str::trim)
        .filter(|uuid| !uuid.is_empty() && *uuid != source_id)
        .map(ToOwned::to_owned);
    let quote = data_message
        .quote
        .as_ref()
        .and_then(SignalQuote::author_identity)
        .map(|author| Quote { author });

    Some(InboundMessage {
        conversation: group_id
            .clone()
            .unwrap_or_else(|| source_id.clone())
            .into(),
        is_group: group_id.is_some(),
        source_id,
        source_alias,
        source_name: envelope
            .source_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned),
        receiving_bot: receiving_bot.clone(),
        text: text.to_string(),
        mentions,
        quote,
        timestamp,
        is_reprocessed: false,
    })
}

fn first_non_empty(candidates: &[Option<&str>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .map(|candidate| candidate.trim())
        .find(|candidate| !candidate.is_empty())
        .map(ToOwned::to_owned)
}

fn envelope_sender_id(envelope: &SignalEnvelope) -> Option<String> {
    first_non_empty(&[
        envelope.source_number.as_deref(),
        envelope.source.as_deref(),
        envelope.source_uuid.as_deref(),
    ])
}

fn envelope_group_id(envelope: &SignalEnvelope) -> Option<String> {
    let group_id = envelope
        .data_message
        .as_ref()?
        .group_info
        .as_ref()?
        .group_id
        .as_deref()?
        .trim();
    if group_id.is_empty() {
        return None;
    }
    Some(group_id.to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct SignalEnvelope {
    source: Option<String>,
    source_number: Option<String>,
    source_uuid: Option<String>,
    source_name: Option<String>,
    timestamp: Option<i64>,
    data_message: Option<SignalDataMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalDataMessage {
    timestamp: Option<i64>,
    message: Option<String>,
    group_info: Option<SignalGroupInfo>,
    mentions: Vec<SignalMention>,
    quote: Option<SignalQuote>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalGroupInfo {
    group_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalMention {
    start: usize,
    length: usize,
    uuid: Option<String>,
    number: Option<String>,
    name: Option<String>,
}

impl SignalMention {
    fn to_mention(&self) -> Option<Mention> {
        let target = first_non_empty(&[self.number.as_deref(), self.uuid.as_deref()])?;
        Some(Mention {
            offset: self.start,
            length: self.length.max(1),
            target,
            label: self.name.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalQuote {
    author: Option<String>,
    author_number: Option<String>,
    author_uuid: Option<String>,
}

impl SignalQuote {
    fn author_identity(&self) -> Option<String> {
        first_non_empty(&[
            self.author_number.as_deref(),
            self.author.as_deref(),
            self.author_uuid.as_deref(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::OutboundMention;

    fn bot() -> BotId {
        BotId::from("+15550001")
    }

    #[test]
    fn normalize_signal_api_base_url_requires_http_or_https() {
        assert_eq!(
            normalize_signal_api_base_url("https://signal-gateway.local/")
                .expect("https URL should normalize"),
            "https://signal-gateway.local"
        );
        assert!(normalize_signal_api_base_url("ssh://signal-gateway.local").is_err());
    }

    #[test]
    fn receive_url_switches_to_websocket_scheme() {
        assert_eq!(
            receive_url_for("http://localhost:8080", "+15550001").expect("ws url"),
            "ws://localhost:8080/v1/receive/+15550001"
        );
        assert_eq!(
            receive_url_for("https://signal.example", "+1").expect("wss url"),
            "wss://signal.example/v1/receive/+1"
        );
        assert!(receive_url_for("https://signal.example", " ").is_err());

        let client = SignalClient::new("http://localhost:8080", DEFAULT_REQUEST_TIMEOUT)
            .expect("client")
            .with_ws_base_url(Some("wss://edge.example/".to_string()));
        assert_eq!(
            client.receive_url("+1").expect("override"),
            "wss://edge.example/v1/receive/+1"
        );
    }

    #[test]
    fn parse_signal_receive_payload_supports_wrappers() {
        let array_payload = serde_json::json!([
            {
                "envelope": {
                    "source": "+15551234567",
                    "timestamp": 100,
                    "dataMessage": { "message": "hello" }
                }
            }
        ]);
        let wrapped_payload = serde_json::json!({
            "messages": [
                {
                    "source": "+15559876543",
                    "timestamp": 200,
                    "dataMessage": { "message": "world" }
                }
            ]
        });
        let rpc_payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "receive",
            "params": {
                "envelope": {
                    "sourceNumber": "+15550000",
                    "timestamp": 300,
                    "dataMessage": { "message": "rpc" }
                }
            }
        });

        let from_array = parse_signal_receive_payload(array_payload);
        let from_wrapper = parse_signal_receive_payload(wrapped_payload);
        let from_rpc = parse_signal_receive_payload(rpc_payload);
        assert_eq!(from_array[0].source.as_deref(), Some("+15551234567"));
        assert_eq!(from_wrapper[0].source.as_deref(), Some("+15559876543"));
        assert_eq!(from_rpc[0].source_number.as_deref(), Some("+15550000"));
    }

    #[test]
    fn convert_group_message_with_mentions_and_quote() {
        let payload = serde_json::json!({
            "envelope": {
                "sourceNumber": "+15557777",
                "sourceUuid": "7d1b0a6e-0c57-4d8f-a0a6-7a0c4b7b2f10",
                "sourceName": "Dana",
                "timestamp": 1700000000000_i64,
                "dataMessage": {
                    "timestamp": 1700000000000_i64,
                    "message": "\u{FFFC} what do you think?",
                    "groupInfo": { "groupId": "aGVsbG8=" },
                    "mentions": [
                        { "start": 0, "length": 1, "uuid": "bot-uuid", "name": "Scout" }
                    ],
                    "quote": { "id": 1699999999000_i64, "authorUuid": "sage-uuid" }
                }
            }
        });
        let envelope = parse_signal_receive_payload(payload).remove(0);
        let inbound = convert_signal_envelope(&envelope, &bot()).expect("message should convert");
        assert!(inbound.is_group);
        assert_eq!(inbound.conversation.as_str(), "aGVsbG8=");
        assert_eq!(inbound.source_id, "+15557777");
        assert_eq!(
            inbound.source_alias.as_deref(),
            Some("7d1b0a6e-0c57-4d8f-a0a6-7a0c4b7b2f10")
        );
        assert_eq!(inbound.source_name.as_deref(), Some("Dana"));
        assert_eq!(inbound.mentions[0].target, "bot-uuid");
        assert_eq!(inbound.mentions[0].label.as_deref(), Some("Scout"));
        assert_eq!(inbound.quote.map(|q| q.author).as_deref(), Some("sage-uuid"));
        assert_eq!(inbound.timestamp, 1700000000000);
        assert_eq!(inbound.receiving_bot, bot());
        assert!(!inbound.is_reprocessed);
    }

    #[test]
    fn convert_direct_message_uses_sender_as_conversation() {
        let envelope = SignalEnvelope {
            source: Some("+15551234567".to_string()),
            timestamp: Some(1234),
            data_message: Some(SignalDataMessage {
                message: Some("hello".to_string()),
                ..SignalDataMessage::default()
            }),
            ..SignalEnvelope::default()
        };
        let inbound = convert_signal_envelope(&envelope, &bot()).expect("message should convert");
        assert!(!inbound.is_group);
        assert_eq!(inbound.conversation.as_str(), "+15551234567");
        assert_eq!(inbound.timestamp, 1234);
    }

    #[test]
    fn non_message_envelopes_are_ignored() {
        let receipt = SignalEnvelope {
            source: Some("+15551234567".to_string()),
            timestamp: Some(1),
            ..SignalEnvelope::default()
        };
        assert!(convert_signal_envelope(&receipt, &bot()).is_none());

        let empty = SignalEnvelope {
            source: Some("+15551234567".to_string()),
            timestamp: Some(2),
            data_message: Some(SignalDataMessage {
                message: Some("   ".to_string()),
                ..SignalDataMessage::default()
            }),
            ..SignalEnvelope::default()
        };
        assert!(convert_signal_envelope(&empty, &bot()).is_none());

        let anonymous = SignalEnvelope {
            timestamp: Some(3),
            data_message: Some(SignalDataMessage {
                message: Some("who am i".to_string()),
                ..SignalDataMessage::default()
            }),
            ..SignalEnvelope::default()
        };
        assert!(convert_signal_envelope(&anonymous, &bot()).is_none());
    }

    #[test]
    fn send_payload_carries_recipient_and_mentions() {
        let request = SignalSend {
            recipient: Recipient::Group("group.abc".to_string()),
            message: "\u{FFFC} hi".to_string(),
            mentions: vec![OutboundMention {
                author: "+15550002".to_string(),
                start: 0,
                length: 1,
            }],
        };
        let payload = build_send_payload("+15550001", &request);
        assert_eq!(payload["number"], "+15550001");
        assert_eq!(payload["message"], "\u{FFFC} hi");
        assert_eq!(payload["recipients"][0], "group.abc");
        assert_eq!(payload["mentions"][0]["author"], "+15550002");

        let direct = SignalSend {
            recipient: Recipient::Direct("+15557777".to_string()),
            message: "plain".to_string(),
            mentions: vec![],
        };
        let payload = build_send_payload("+15550001", &direct);
        assert_eq!(payload["recipients"][0], "+15557777");
        assert!(payload.get("mentions").is_none());
    }
}
