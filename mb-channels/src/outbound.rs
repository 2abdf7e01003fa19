use crate::traits::{OutboundMention, Recipient, SignalSend, SignalTransport};
use anyhow::{Result, anyhow};
use mb_core::{BotId, BotRoster, MentionTarget, ProfileCache, encode_mentions, split_message};
use std::sync::Arc;

pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2000;

/// Turns a reply into transport sends: chunking, mention encoding and group
/// id resolution.
pub struct OutboundSender {
    transport: Arc<dyn SignalTransport>,
    roster: Arc<BotRoster>,
    profiles: Arc<ProfileCache>,
    max_message_length: usize,
}

impl OutboundSender {
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        roster: Arc<BotRoster>,
        profiles: Arc<ProfileCache>,
    ) -> Self {
        Self {
            transport,
            roster,
            profiles,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_message_length(mut self, max_message_length: usize) -> Self {
        self.max_message_length = max_message_length.max(1);
        self
    }

    fn mention_table(&self) -> Vec<MentionTarget> {
        let mut table = self.roster.mention_targets();
        table.extend(self.profiles.mention_targets());
        table
    }

    /// Sends `text` from `bot`, returning the number of chunks delivered.
    #[tracing::instrument(level = "debug", skip_all, fields(bot_id = %bot))]
    pub async fn send_text(&self, bot: &BotId, recipient: &Recipient, text: &str) -> Result<usize> {
        if self.roster.get(bot).is_none() {
            return Err(anyhow!("unknown bot: {bot}"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let recipient = match recipient {
            Recipient::Group(group_id) => {
                Recipient::Group(self.transport.resolve_group(bot, group_id).await?)
            }
            direct => direct.clone(),
        };

        let chunks = split_message(text, self.max_message_length);
        let table = self.mention_table();
        for (index, chunk) in chunks.iter().enumerate() {
            // Only the first chunk pings; later chunks keep plain `@name` text.
            let request = if index == 0 {
                let encoded = encode_mentions(chunk, &table);
                SignalSend {
                    recipient: recipient.clone(),
                    message: encoded.text,
                    mentions: encoded.mentions.iter().map(OutboundMention::from).collect(),
                }
            } else {
                SignalSend {
                    recipient: recipient.clone(),
                    message: chunk.clone(),
                    mentions: Vec::new(),
                }
            };
            self.transport.send(bot, &request).await.map_err(|e| {
                anyhow!("send chunk {}/{} failed: {e:#}", index + 1, chunks.len())
            })?;
        }
        tracing::debug!(chunks = chunks.len(), "outbound message sent");
        Ok(chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mb_core::{BotProfile, MENTION_PLACEHOLDER};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(BotId, SignalSend)>>,
        fail: bool,
    }

    #[async_trait]
    impl SignalTransport for RecordingTransport {
        async fn send(&self, bot: &BotId, request: &SignalSend) -> Result<()> {
            if self.fail {
                return Err(anyhow!("status=500"));
            }
            self.sent
                .lock()
                .expect("sent")
                .push((bot.clone(), request.clone()));
            Ok(())
        }

        async fn resolve_group(&self, _bot: &BotId, group_id: &str) -> Result<String> {
            Ok(format!("group.{group_id}"))
        }
    }

    fn sender(transport: Arc<RecordingTransport>, max: usize) -> OutboundSender {
        let roster = BotRoster::new(vec![
            BotProfile {
                name: "Scout".to_string(),
                number: "+15550001".to_string(),
                uuid: None,
                agent_id: "agent-scout".to_string(),
            },
            BotProfile {
                name: "Sage".to_string(),
                number: "+15550002".to_string(),
                uuid: None,
                agent_id: "agent-sage".to_string(),
            },
        ])
        .expect("roster");
        let profiles = ProfileCache::new();
        profiles.remember("+15557777", "Dana");
        OutboundSender::new(transport, Arc::new(roster), Arc::new(profiles))
            .with_max_message_length(max)
    }

    #[tokio::test]
    async fn first_chunk_carries_mentions_only() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = sender(transport.clone(), 40);
        let text = "@Sage please review this change and then @Dana can merge it tonight";
        let bot = BotId::from("+15550001");
        let sent = sender
            .send_text(&bot, &Recipient::Group("abc".to_string()), text)
            .await
            .expect("send");
        assert_eq!(sent, 2);

        let sent = transport.sent.lock().expect("sent").clone();
        assert_eq!(sent[0].1.recipient, Recipient::Group("group.abc".to_string()));
        assert!(sent[0].1.message.starts_with(MENTION_PLACEHOLDER));
        assert_eq!(sent[0].1.mentions.len(), 1);
        assert_eq!(sent[0].1.mentions[0].author, "+15550002");
        assert!(sent[1].1.mentions.is_empty());
        assert!(sent[1].1.message.contains("@Dana"));
    }

    #[tokio::test]
    async fn direct_reply_encodes_profile_names() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = sender(transport.clone(), 2000);
        let bot = BotId::from("+15550002");
        sender
            .send_text(&bot, &Recipient::Direct("+15557777".to_string()), "thanks @Dana!")
            .await
            .expect("send");
        let sent = transport.sent.lock().expect("sent").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.recipient, Recipient::Direct("+15557777".to_string()));
        assert_eq!(sent[0].1.mentions[0].author, "+15557777");
        assert_eq!(sent[0].1.mentions[0].start, 7);
    }

    #[tokio::test]
    async fn rejects_unknown_bot_and_reports_transport_failure() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..RecordingTransport::default()
        });
        let sender = sender(transport, 2000);
        let recipient = Recipient::Direct("+15557777".to_string());
        assert!(
            sender
                .send_text(&BotId::from("+19999"), &recipient, "hi")
                .await
                .is_err()
        );
        let err = sender
            .send_text(&BotId::from("+15550001"), &recipient, "hi")
            .await
            .expect_err("transport failure");
        assert!(err.to_string().contains("send chunk 1/1 failed"));
    }
}
