//! Fan-in point: every bot feed and every repair replay lands in one queue.

use crate::responder::{Responder, ResponderRequest};
use anyhow::Result;
use mb_channels::{OutboundSender, Recipient};
use mb_core::{ConsistencyChecker, InboundMessage, ResponseRouter, RoutedMessage, RoutingOutcome};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Gateway {
    router: Arc<ResponseRouter>,
    checker: Arc<ConsistencyChecker>,
    responder: Arc<dyn Responder>,
    outbound: Arc<OutboundSender>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
}

impl Gateway {
    pub fn new(
        router: Arc<ResponseRouter>,
        checker: Arc<ConsistencyChecker>,
        responder: Arc<dyn Responder>,
        outbound: Arc<OutboundSender>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            router,
            checker,
            responder,
            outbound,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(cancel).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                return Ok(());
            };

            if let Err(e) = self.handle_inbound(inbound).await {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
    }

    /// Routes one arrival and spawns a delivery per activation. Deliveries run
    /// detached so a slow agent never stalls the queue.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(bot_id = %inbound.receiving_bot, reprocessed = inbound.is_reprocessed)
    )]
    pub(crate) async fn handle_inbound(&self, inbound: InboundMessage) -> Result<Vec<JoinHandle<()>>> {
        self.checker.record_arrival(&inbound);

        let routed = match self.router.route(&inbound).await? {
            RoutingOutcome::Routed(routed) => routed,
            RoutingOutcome::Dropped { reason } => {
                tracing::debug!(reason, "inbound message dropped");
                return Ok(Vec::new());
            }
            RoutingOutcome::Duplicate { key, first_receiver } => {
                tracing::debug!(message_key = %key, first_receiver = ?first_receiver, "duplicate arrival");
                return Ok(Vec::new());
            }
            RoutingOutcome::Excluded { key } => {
                tracing::debug!(message_key = %key, "message excluded by escape marker");
                return Ok(Vec::new());
            }
        };

        let routed = Arc::new(routed);
        let handles = routed
            .activations
            .iter()
            .cloned()
            .map(|activation| {
                let request = ResponderRequest::new(activation, &inbound, &routed);
                let this = self.clone();
                let routed = routed.clone();
                tokio::spawn(async move { this.deliver(request, &routed).await })
            })
            .collect();
        Ok(handles)
    }

    async fn deliver(&self, request: ResponderRequest, routed: &RoutedMessage) {
        let activation = &request.activation;
        let reply = match self.responder.respond(&request).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    bot_id = %activation.bot,
                    agent_id = %activation.agent_id,
                    message_key = %routed.key,
                    error = %format!("{e:#}"),
                    "responder failed"
                );
                return;
            }
        };

        let recipient = Recipient::for_conversation(&activation.conversation, activation.is_group);
        match self
            .outbound
            .send_text(&activation.bot, &recipient, &reply)
            .await
        {
            Ok(chunks) => tracing::info!(
                bot_id = %activation.bot,
                reason = %activation.reason,
                message_key = %routed.key,
                chunks,
                "reply delivered"
            ),
            Err(e) => tracing::error!(
                bot_id = %activation.bot,
                recipient = ?recipient,
                message_key = %routed.key,
                error = %format!("{e:#}"),
                "reply delivery failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use mb_channels::{SignalSend, SignalTransport};
    use mb_core::{
        BotId, BotProfile, BotRoster, Deduplicator, InteractionCounters, MemoryStateStore,
        Mention, ProfileCache, ReconnectManager, ReconnectPolicy, RoutingSettings,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(BotId, SignalSend)>>,
    }

    #[async_trait]
    impl SignalTransport for RecordingTransport {
        async fn send(&self, bot: &BotId, request: &SignalSend) -> Result<()> {
            self.sent
                .lock()
                .expect("sent")
                .push((bot.clone(), request.clone()));
            Ok(())
        }

        async fn resolve_group(&self, _bot: &BotId, group_id: &str) -> Result<String> {
            Ok(group_id.to_string())
        }
    }

    struct EchoResponder {
        fail: bool,
    }

    #[async_trait]
    impl Responder for EchoResponder {
        async fn respond(&self, request: &ResponderRequest) -> Result<Option<String>> {
            if self.fail {
                return Err(anyhow!("agent offline"));
            }
            Ok(Some(format!(
                "{} heard: {}",
                request.activation.agent_id, request.text
            )))
        }
    }

    struct Harness {
        gateway: Gateway,
        transport: Arc<RecordingTransport>,
        store: Arc<MemoryStateStore>,
        checker: Arc<ConsistencyChecker>,
    }

    fn harness(fail: bool) -> Harness {
        let roster = Arc::new(
            BotRoster::new(vec![
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
            .expect("roster"),
        );
        let profiles = Arc::new(ProfileCache::new());
        let store = Arc::new(MemoryStateStore::new());
        let counters = Arc::new(InteractionCounters::new(store.clone(), 10));
        let router = Arc::new(ResponseRouter::new(
            roster.clone(),
            profiles.clone(),
            Arc::new(Deduplicator::default()),
            counters,
            store.clone(),
            RoutingSettings::default(),
        ));
        let (replay_tx, _replay_rx) = mpsc::channel(8);
        let manager = Arc::new(ReconnectManager::new(ReconnectPolicy::default(), replay_tx));
        let checker = Arc::new(ConsistencyChecker::new(
            roster.clone(),
            manager,
            Duration::from_secs(2),
        ));
        let transport = Arc::new(RecordingTransport::default());
        let outbound = Arc::new(OutboundSender::new(transport.clone(), roster, profiles));
        let (_tx, rx) = mpsc::channel(8);
        let gateway = Gateway::new(
            router,
            checker.clone(),
            Arc::new(EchoResponder { fail }),
            outbound,
            rx,
        );
        Harness {
            gateway,
            transport,
            store,
            checker,
        }
    }

    fn group_mention(receiver: &str) -> InboundMessage {
        let text = "\u{FFFC} can you check the deploy?".to_string();
        InboundMessage {
            source_id: "+15557777".to_string(),
            source_alias: None,
            source_name: Some("Dana".to_string()),
            conversation: "group-1".into(),
            is_group: true,
            receiving_bot: BotId::from(receiver),
            text,
            mentions: vec![Mention {
                offset: 0,
                length: 1,
                target: "+15550002".to_string(),
                label: None,
            }],
            quote: None,
            timestamp: 1_700_000_000_000,
            is_reprocessed: false,
        }
    }

    async fn settle(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.expect("delivery task");
        }
    }

    #[tokio::test]
    async fn mentioned_bot_replies_once_to_group_broadcast() {
        let h = harness(false);
        let first = h
            .gateway
            .handle_inbound(group_mention("+15550001"))
            .await
            .expect("first arrival");
        assert_eq!(first.len(), 1);
        settle(first).await;

        let second = h
            .gateway
            .handle_inbound(group_mention("+15550002"))
            .await
            .expect("second arrival");
        assert!(second.is_empty());

        let sent = h.transport.sent.lock().expect("sent").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, BotId::from("+15550002"));
        assert_eq!(sent[0].1.recipient, Recipient::Group("group-1".to_string()));
        assert!(sent[0].1.message.starts_with("agent-sage heard: "));
        assert_eq!(sent[0].1.mentions.len(), 1);
        assert_eq!(sent[0].1.mentions[0].author, "+15550002");
        assert_eq!(h.store.activations().len(), 1);
        assert_eq!(h.checker.pending(), 1);
        h.checker.shutdown();
    }

    #[tokio::test]
    async fn responder_failure_sends_nothing() {
        let h = harness(true);
        let handles = h
            .gateway
            .handle_inbound(group_mention("+15550001"))
            .await
            .expect("arrival");
        settle(handles).await;
        assert!(h.transport.sent.lock().expect("sent").is_empty());
        assert_eq!(h.store.activations().len(), 1);
        h.checker.shutdown();
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancel() {
        let h = harness(false);
        let cancel = CancellationToken::new();
        let handle = Arc::new(h.gateway).start(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stops")
            .expect("join");
    }
}
