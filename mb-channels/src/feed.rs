use crate::signal::{SignalClient, convert_signal_envelope, parse_signal_receive_payload};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mb_core::{BotId, CoreError, FeedConnector, InboundMessage, ReadySignal};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

/// Websocket receive feed for one bot account. Every decoded message is pushed
/// into the shared gateway queue tagged with the receiving bot.
#[derive(Clone)]
pub struct SignalFeed {
    client: SignalClient,
    tx: mpsc::Sender<InboundMessage>,
}

impl SignalFeed {
    pub fn new(client: SignalClient, tx: mpsc::Sender<InboundMessage>) -> Self {
        Self { client, tx }
    }

    async fn run_once(&self, bot: &BotId, ready: ReadySignal) -> Result<()> {
        let url = self.client.receive_url(bot.as_str())?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = self.client.api_token() {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, mut read) = ws.split();
        ready.mark_ready().await;

        while let Some(frame) = read.next().await {
            match frame? {
                Message::Text(text) => {
                    for message in decode_frame(text.as_str(), bot) {
                        self.tx
                            .send(message)
                            .await
                            .map_err(|e| anyhow!("signal inbound queue closed: {e}"))?;
                    }
                }
                Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
                Message::Close(frame) => {
                    return Err(anyhow!("signal receive stream closed: {frame:?}"));
                }
                _ => {}
            }
        }
        Err(anyhow!("signal receive stream ended"))
    }
}

#[async_trait]
impl FeedConnector for SignalFeed {
    async fn run_connection(&self, bot: &BotId, ready: ReadySignal) -> mb_core::Result<()> {
        self.run_once(bot, ready)
            .await
            .map_err(|e| CoreError::Connection(format!("{e:#}")))
    }
}

fn decode_frame(text: &str, bot: &BotId) -> Vec<InboundMessage> {
    let body: serde_json::Value = match serde_json::from_str(text) {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(bot_id = %bot, %error, "ignoring non-JSON signal frame");
            return Vec::new();
        }
    };
    parse_signal_receive_payload(body)
        .iter()
        .filter_map(|envelope| convert_signal_envelope(envelope, bot))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::decode_frame;
    use mb_core::BotId;

    #[test]
    fn decode_frame_tags_receiving_bot() {
        let frame = r#"{"envelope":{"sourceNumber":"+15557777","timestamp":5,"dataMessage":{"message":"hi","groupInfo":{"groupId":"g1"}}}}"#;
        let bot = BotId::from("+15550002");
        let messages = decode_frame(frame, &bot);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].receiving_bot, bot);
        assert_eq!(messages[0].conversation.as_str(), "g1");
    }

    #[test]
    fn decode_frame_ignores_garbage() {
        let bot = BotId::from("+15550002");
        assert!(decode_frame("not json", &bot).is_empty());
        assert!(decode_frame(r#"{"envelope":{"typingMessage":{}}}"#, &bot).is_empty());
    }
}
