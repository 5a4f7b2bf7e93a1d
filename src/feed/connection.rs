//! Live feed connection
//!
//! Owns exactly one subscription to the update stream at a time:
//! - `start` tears down any running subscription (and awaits its task) first
//! - Reconnects with bounded exponential backoff; exhaustion moves the
//!   session to `Failed` and is reported, never retried silently
//! - A frame that fails to decode is counted and skipped
//! - `stop` is idempotent and closes the socket before returning

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::ris_live::{decode_frame, RisFrame, RisSubscribeMessage};
use super::session::{
    HeartbeatAction, SessionConfig, SessionManager, SessionState, TransitionReason,
};
use crate::models::{RouteUpdate, SubscriptionSpec};

/// Receives decoded updates in arrival order
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, update: RouteUpdate);
}

#[derive(Debug, Default)]
pub struct FeedStats {
    pub frames_received: AtomicU64,
    pub updates_delivered: AtomicU64,
    pub decode_errors: AtomicU64,
    pub control_frames: AtomicU64,
    pub server_errors: AtomicU64,
}

impl FeedStats {
    pub fn summary(&self) -> String {
        format!(
            "frames={} updates={} decode_errors={} control={} server_errors={}",
            self.frames_received.load(Ordering::Relaxed),
            self.updates_delivered.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.control_frames.load(Ordering::Relaxed),
            self.server_errors.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    RetriesExhausted { attempts: u32 },
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::RetriesExhausted { attempts } => {
                write!(f, "feed unreachable after {} reconnect attempts", attempts)
            }
        }
    }
}

impl std::error::Error for FeedError {}

struct ActiveSubscription {
    spec: SubscriptionSpec,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), FeedError>>,
}

pub struct FeedConnection {
    url: String,
    session: Arc<SessionManager>,
    handler: Arc<dyn UpdateHandler>,
    stats: Arc<FeedStats>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl FeedConnection {
    pub fn new(url: &str, config: SessionConfig, handler: Arc<dyn UpdateHandler>) -> Self {
        Self {
            url: url.to_string(),
            session: Arc::new(SessionManager::new(config)),
            handler,
            stats: Arc::new(FeedStats::default()),
            active: Mutex::new(None),
        }
    }

    /// Replace the running subscription (if any) with `spec`
    pub async fn start(&self, spec: SubscriptionSpec) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(
                prefixes = previous.spec.prefixes.len(),
                "feed_restarting_subscription"
            );
            self.shutdown(previous).await;
        }

        self.session.reset();
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = FeedWorker {
            url: self.url.clone(),
            spec: spec.clone(),
            session: self.session.clone(),
            handler: self.handler.clone(),
            stats: self.stats.clone(),
        };
        let handle = tokio::spawn(worker.run(stop_rx));

        info!(
            url = %self.url,
            prefixes = ?spec.prefixes,
            more_specific = spec.more_specific,
            "feed_started"
        );
        *active = Some(ActiveSubscription {
            spec,
            stop_tx,
            handle,
        });
    }

    /// Stop the running subscription; a no-op when nothing is running
    pub async fn stop(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            self.shutdown(previous).await;
            info!(
                session = %self.session.metrics().summary(),
                feed = %self.stats.summary(),
                "feed_stopped"
            );
        }
    }

    async fn shutdown(&self, sub: ActiveSubscription) {
        let _ = sub.stop_tx.send(true);
        match sub.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "feed_task_had_failed"),
            Err(e) => error!(error = %e, "feed_task_panicked"),
        }
        if !matches!(self.session.state(), SessionState::Failed) {
            self.session
                .transition(SessionState::Stopped, TransitionReason::StopRequested);
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Watch channel over session transitions
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub async fn current_spec(&self) -> Option<SubscriptionSpec> {
        self.active.lock().await.as_ref().map(|a| a.spec.clone())
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}

/// Resolves once a stop is signalled or the sender is gone. The borrowed
/// value is dropped here so the future stays `Send`.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

struct FeedWorker {
    url: String,
    spec: SubscriptionSpec,
    session: Arc<SessionManager>,
    handler: Arc<dyn UpdateHandler>,
    stats: Arc<FeedStats>,
}

impl FeedWorker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) -> Result<(), FeedError> {
        self.session
            .transition(SessionState::Connecting, TransitionReason::Started);

        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }

            match self.session.state() {
                SessionState::Connecting | SessionState::Subscribing | SessionState::Streaming => {
                    match self.run_connection(&mut stop_rx).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warn!(error = %e, url = %self.url, "feed_connection_error");
                            if !matches!(self.session.state(), SessionState::Reconnecting) {
                                self.session.transition(
                                    SessionState::Reconnecting,
                                    TransitionReason::NetworkError,
                                );
                            }
                        }
                    }
                }
                SessionState::Reconnecting => {
                    if self.session.retries_exhausted() {
                        let attempts = self.session.backoff_attempt();
                        error!(attempts, url = %self.url, "feed_retries_exhausted");
                        self.session
                            .transition(SessionState::Failed, TransitionReason::RetriesExhausted);
                        return Err(FeedError::RetriesExhausted { attempts });
                    }

                    let backoff = self.session.next_backoff();
                    warn!(
                        attempt = self.session.backoff_attempt(),
                        max_attempts = self.session.config().max_reconnect_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "feed_reconnect_backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {
                            self.session.transition(
                                SessionState::Connecting,
                                TransitionReason::BackoffElapsed,
                            );
                        }
                        _ = stop_requested(&mut stop_rx) => return Ok(()),
                    }
                }
                SessionState::Idle | SessionState::Failed | SessionState::Stopped => {
                    return Ok(());
                }
            }
        }
    }

    /// One connection lifecycle; `Ok` only when a stop was requested
    async fn run_connection(&self, stop_rx: &mut watch::Receiver<bool>) -> Result<()> {
        debug!(url = %self.url, "connecting");

        let connect_result =
            tokio::time::timeout(self.session.connect_timeout(), connect_async(self.url.as_str()))
                .await;

        let (ws_stream, _response) = match connect_result {
            Ok(Ok((ws, resp))) => (ws, resp),
            Ok(Err(e)) => {
                self.session
                    .transition(SessionState::Reconnecting, TransitionReason::NetworkError);
                return Err(e.into());
            }
            Err(_) => {
                self.session
                    .transition(SessionState::Reconnecting, TransitionReason::ConnectTimeout);
                return Err(anyhow::anyhow!("connect timeout"));
            }
        };

        let (mut write, mut read) = ws_stream.split();

        let sub_json = serde_json::to_string(&RisSubscribeMessage::for_spec(&self.spec))
            .context("Failed to serialize subscribe message")?;
        if let Err(e) = write.send(Message::Text(sub_json)).await {
            self.session
                .transition(SessionState::Reconnecting, TransitionReason::NetworkError);
            return Err(e.into());
        }
        self.session
            .transition(SessionState::Subscribing, TransitionReason::SubscribeSent);

        let mut heartbeat_check = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                _ = stop_requested(stop_rx) => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.mark_alive();
                            self.dispatch(&text).await;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            self.mark_alive();
                            match String::from_utf8(bytes) {
                                Ok(text) => self.dispatch(&text).await,
                                Err(_) => {
                                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                                    warn!("feed_binary_frame_not_utf8");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            self.mark_alive();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.mark_alive();
                            self.session.record_pong_received();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server_close");
                            self.session.transition(SessionState::Reconnecting, TransitionReason::ServerClose);
                            return Err(anyhow::anyhow!("server closed connection"));
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "ws_error");
                            self.session.transition(SessionState::Reconnecting, TransitionReason::NetworkError);
                            return Err(e.into());
                        }
                        None => {
                            warn!("stream_ended");
                            self.session.transition(SessionState::Reconnecting, TransitionReason::ServerClose);
                            return Err(anyhow::anyhow!("stream ended"));
                        }
                        _ => {}
                    }
                }

                _ = heartbeat_check.tick() => {
                    match self.session.check_heartbeat() {
                        HeartbeatAction::Ok => {}
                        HeartbeatAction::SendPing => {
                            if let Err(e) = write.send(Message::Ping(vec![])).await {
                                warn!(error = %e, "ping_send_failed");
                            } else {
                                self.session.record_ping_sent();
                            }
                        }
                        HeartbeatAction::PongTimeout => {
                            warn!("pong_timeout");
                            self.session.transition(SessionState::Reconnecting, TransitionReason::PongTimeout);
                            return Err(anyhow::anyhow!("pong timeout"));
                        }
                        HeartbeatAction::DataStale => {
                            warn!("data_stale");
                            self.session.transition(SessionState::Reconnecting, TransitionReason::DataStale);
                            return Err(anyhow::anyhow!("data stale"));
                        }
                    }
                }
            }
        }
    }

    fn mark_alive(&self) {
        self.session.record_data_received();
        if self.session.state() == SessionState::Subscribing {
            self.session
                .transition(SessionState::Streaming, TransitionReason::FirstMessage);
        }
    }

    async fn dispatch(&self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match decode_frame(text) {
            Ok(RisFrame::Updates(updates)) => {
                for update in updates {
                    self.handler.handle(update).await;
                    self.stats.updates_delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(RisFrame::Control(kind)) => {
                self.stats.control_frames.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %kind, "feed_control_frame");
            }
            Ok(RisFrame::ServerError(message)) => {
                self.stats.server_errors.fetch_add(1, Ordering::Relaxed);
                warn!(message = %message, "feed_server_error");
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = text.len(), "feed_decode_error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait]
    impl UpdateHandler for NullHandler {
        async fn handle(&self, _update: RouteUpdate) {}
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let feed = FeedConnection::new(
            "ws://127.0.0.1:9/",
            SessionConfig::default(),
            Arc::new(NullHandler),
        );
        feed.stop().await;
        feed.stop().await;
        assert_eq!(feed.state(), SessionState::Idle);
        assert!(feed.current_spec().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_error_counted_and_skipped() {
        let worker = FeedWorker {
            url: String::new(),
            spec: SubscriptionSpec::new(vec![], true),
            session: Arc::new(SessionManager::new(SessionConfig::default())),
            handler: Arc::new(NullHandler),
            stats: Arc::new(FeedStats::default()),
        };

        worker.dispatch("{{garbage").await;
        worker
            .dispatch(r#"{"type":"ris_message","data":{"host":"rrc01","withdrawals":["203.0.113.0/24"]}}"#)
            .await;

        assert_eq!(worker.stats.frames_received.load(Ordering::Relaxed), 2);
        assert_eq!(worker.stats.decode_errors.load(Ordering::Relaxed), 1);
        assert_eq!(worker.stats.updates_delivered.load(Ordering::Relaxed), 1);
    }
}
