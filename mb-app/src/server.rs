//! multibot server: one supervised Signal feed per bot, a shared routing
//! gateway, and a small HTTP surface for health and manual sends.

use crate::config::{MultibotConfig, expand_home};
use crate::gateway::Gateway;
use crate::responder::{HttpResponder, NoopResponder, Responder};
use crate::routes;
use crate::store::SqliteStateStore;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use mb_channels::{OutboundSender, Recipient, SignalClient, SignalFeed};
use mb_core::{
    BotId, BotRoster, ConsistencyChecker, CoreError, Deduplicator, FeedConnector,
    InteractionCounters, MemoryStateStore, ProfileCache, ReconnectManager, ResponseRouter,
    StateStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub started_at: Instant,
    pub roster: Arc<BotRoster>,
    pub dedup: Arc<Deduplicator>,
    pub reconnect: Arc<ReconnectManager>,
    pub checker: Arc<ConsistencyChecker>,
    pub outbound: Arc<OutboundSender>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = MultibotConfig::load_with_path(config_path).await?;
    let roster = cfg.roster()?;
    tracing::info!(
        config_path = %path.display(),
        bots = roster.len(),
        privacy_mode = ?cfg.routing.privacy_mode,
        random_reply_rate = cfg.routing.random_reply_rate,
        bot_to_bot_limit = cfg.routing.bot_to_bot_limit,
        store_path = %cfg.store.path,
        responder_configured = cfg.responder.url.is_some(),
        "config ok"
    );
    for bot in roster.bots() {
        tracing::info!(
            name = %bot.name,
            number = %bot.number,
            uuid = ?bot.uuid,
            agent_id = %bot.agent_id,
            "roster entry"
        );
    }

    let client = signal_client(&cfg)?;
    client.probe().await?;
    tracing::info!(api_base_url = %client.api_base_url(), "signal gateway reachable");
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    bot: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = MultibotConfig::load(config_path).await?;
    let roster = Arc::new(cfg.roster()?);
    let bot = resolve_bot(&roster, bot)?;
    let recipient = Recipient::parse(recipient)
        .ok_or_else(|| anyhow::anyhow!("recipient is required"))?;

    let outbound = OutboundSender::new(
        Arc::new(signal_client(&cfg)?),
        roster,
        Arc::new(ProfileCache::new()),
    )
    .with_max_message_length(cfg.routing.max_message_length);
    let chunks = outbound.send_text(&bot, &recipient, message).await?;
    tracing::info!(bot_id = %bot, chunks, "message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = MultibotConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    tracing::info!(
        config_path = %cfg_path.display(),
        bots = cfg.bots.len(),
        privacy_mode = ?cfg.routing.privacy_mode,
        random_reply_rate = cfg.routing.random_reply_rate,
        bot_to_bot_limit = cfg.routing.bot_to_bot_limit,
        max_bot_responses = ?cfg.routing.max_bot_responses,
        max_message_length = cfg.routing.max_message_length,
        consistency_window_ms = cfg.consistency.window_ms,
        dedup_ttl_ms = cfg.consistency.dedup_ttl_ms,
        reconnect_base_delay_ms = cfg.reconnect.base_delay_ms,
        reconnect_max_delay_ms = cfg.reconnect.max_delay_ms,
        reconnect_max_window_secs = cfg.reconnect.max_window_secs,
        store_path = %cfg.store.path,
        responder_configured = cfg.responder.url.is_some(),
        server_enabled = cfg.server.enabled,
        server_port = cfg.server.port,
        "server configuration loaded"
    );
    let listener = if cfg.server.enabled {
        let addr = SocketAddr::from(([127, 0, 0, 1], cfg.server.port));
        Some(preflight_bind_listener(addr).await?)
    } else {
        None
    };

    let roster = Arc::new(cfg.roster()?);
    let profiles = Arc::new(ProfileCache::new());
    let dedup = Arc::new(Deduplicator::new(
        cfg.consistency.dedup_ttl(),
        cfg.consistency.dedup_sweep(),
    ));
    let store = open_store(&cfg)?;
    let counters = Arc::new(InteractionCounters::new(
        store.clone(),
        cfg.routing.bot_to_bot_limit,
    ));
    let router = Arc::new(ResponseRouter::new(
        roster.clone(),
        profiles.clone(),
        dedup.clone(),
        counters,
        store,
        cfg.routing.settings(),
    ));

    // Feeds and repair replays share one queue.
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let reconnect = Arc::new(ReconnectManager::new(
        cfg.reconnect.policy(),
        inbound_tx.clone(),
    ));
    let checker = Arc::new(ConsistencyChecker::new(
        roster.clone(),
        reconnect.clone(),
        cfg.consistency.window(),
    ));

    let client = signal_client(&cfg)?;
    let outbound = Arc::new(
        OutboundSender::new(Arc::new(client.clone()), roster.clone(), profiles)
            .with_max_message_length(cfg.routing.max_message_length),
    );
    let responder = build_responder(&cfg)?;

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(
        router,
        checker.clone(),
        responder,
        outbound.clone(),
        inbound_rx,
    ));
    let gateway_handle = gateway.start(shutdown.child_token());

    let feed: Arc<dyn FeedConnector> = Arc::new(SignalFeed::new(client, inbound_tx));
    let supervisors = spawn_supervisors(&roster, &reconnect, &feed, &shutdown);
    tracing::info!(
        bots = ?roster.bot_ids(),
        "gateway started"
    );

    match listener {
        Some(listener) => {
            let state = Arc::new(AppState {
                started_at,
                roster: roster.clone(),
                dedup,
                reconnect: reconnect.clone(),
                checker: checker.clone(),
                outbound,
            });
            let app = build_app(&cfg, state);
            tracing::info!(port = cfg.server.port, "multibot serving");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
                .await?;
            tracing::info!("http server shutdown completed");
        }
        None => shutdown_signal(shutdown.clone()).await,
    }

    shutdown.cancel();
    checker.shutdown();
    for handle in supervisors {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "feed supervisor join failed during shutdown");
        }
    }
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

fn spawn_supervisors(
    roster: &BotRoster,
    reconnect: &Arc<ReconnectManager>,
    feed: &Arc<dyn FeedConnector>,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    roster
        .bot_ids()
        .into_iter()
        .map(|bot| {
            reconnect.register(&bot);
            let manager = reconnect.clone();
            let feed = feed.clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                match manager.supervise(bot.clone(), feed, cancel).await {
                    Ok(()) => tracing::info!(bot_id = %bot, "feed supervisor stopped"),
                    Err(CoreError::ReconnectExhausted { bot_id, elapsed }) => tracing::error!(
                        bot_id = %bot_id,
                        elapsed_secs = elapsed.as_secs(),
                        "bot offline; manual intervention required"
                    ),
                    Err(e) => tracing::error!(bot_id = %bot, error = %e, "feed supervisor exited"),
                }
            })
        })
        .collect()
}

fn build_app(cfg: &MultibotConfig, state: Arc<AppState>) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.server.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn signal_client(cfg: &MultibotConfig) -> Result<SignalClient> {
    Ok(
        SignalClient::new(&cfg.signal.api_base_url, cfg.request_timeout())?
            .with_api_token(cfg.signal.api_token.clone())
            .with_ws_base_url(cfg.signal.ws_base_url.clone()),
    )
}

fn open_store(cfg: &MultibotConfig) -> Result<Arc<dyn StateStore>> {
    if cfg.store.is_in_memory() {
        tracing::warn!("state store is in-memory; history and counters are lost on restart");
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    let path = expand_home(&cfg.store.path)?;
    let store = SqliteStateStore::open(&path)?;
    tracing::info!(path = %path.display(), "sqlite state store opened");
    Ok(Arc::new(store))
}

fn build_responder(cfg: &MultibotConfig) -> Result<Arc<dyn Responder>> {
    match cfg.responder.url.as_deref() {
        Some(url) => Ok(Arc::new(
            HttpResponder::new(url, cfg.responder.timeout())?
                .with_auth_token(cfg.responder.auth_token.clone()),
        )),
        None => {
            tracing::warn!("responder.url not set; activations will be recorded without replies");
            Ok(Arc::new(NoopResponder))
        }
    }
}

/// Accepts a roster name (case-insensitive) or any bot identity.
pub(crate) fn resolve_bot(roster: &BotRoster, raw: &str) -> Result<BotId> {
    let raw = raw.trim();
    roster
        .by_name(raw)
        .or_else(|| roster.resolve(raw))
        .map(|profile| profile.id())
        .ok_or_else(|| anyhow::anyhow!("unknown bot: {raw}"))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
