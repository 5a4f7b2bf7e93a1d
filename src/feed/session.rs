//! Feed session management
//!
//! Connection lifecycle for the live update stream:
//! - State machine with well-defined transitions
//! - Exponential backoff with jitter, bounded by an attempt budget
//! - Heartbeat monitoring (ping/pong + data staleness)
//! - State published on a watch channel so supervisors can react to `Failed`
//!
//! The attempt budget is only refunded after a stream stays healthy for
//! `min_healthy_stream_ms`; a server that accepts and immediately drops the
//! connection still exhausts it.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the delay applied as +/- jitter
    pub jitter_factor: f64,
    /// Consecutive failed attempts before the session is declared failed
    pub max_reconnect_attempts: u32,
    /// Streaming time after which a disconnect no longer counts against the budget
    pub min_healthy_stream_ms: u64,

    pub connect_timeout_ms: u64,

    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub stale_data_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 5_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_reconnect_attempts: 5,
            min_healthy_stream_ms: 30_000,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            stale_data_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No subscription has been started
    Idle,
    /// WebSocket handshake in progress
    Connecting,
    /// Connected, subscription request sent
    Subscribing,
    /// Receiving updates
    Streaming,
    /// Connection lost, waiting for backoff timer
    Reconnecting,
    /// Attempt budget exhausted; a new `start` is required
    Failed,
    /// Stopped on request
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// No task is driving the session in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    SubscribeSent,
    FirstMessage,
    ConnectTimeout,
    PongTimeout,
    DataStale,
    ServerClose,
    NetworkError,
    BackoffElapsed,
    RetriesExhausted,
    StopRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::SubscribeSent => "subscribe_sent",
            Self::FirstMessage => "first_message",
            Self::ConnectTimeout => "connect_timeout",
            Self::PongTimeout => "pong_timeout",
            Self::DataStale => "data_stale",
            Self::ServerClose => "server_close",
            Self::NetworkError => "network_error",
            Self::BackoffElapsed => "backoff_elapsed",
            Self::RetriesExhausted => "retries_exhausted",
            Self::StopRequested => "stop",
        };
        f.write_str(s)
    }
}

/// Jittered exponential delays over a fixed attempt budget
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter_factor: f64,
    budget: u32,
    attempt: u32,
}

impl BackoffCalculator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms as f64,
            max_ms: config.backoff_max_ms as f64,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            budget: config.max_reconnect_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; spends one attempt
    pub fn next_backoff(&mut self) -> Duration {
        let delay = (self.base_ms * self.multiplier.powi(self.attempt as i32)).min(self.max_ms);
        let spread = delay * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        self.attempt += 1;
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ok,
    SendPing,
    PongTimeout,
    DataStale,
}

/// Ping/pong and data-staleness tracking for one connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    stale_after: Duration,
    /// Set while a ping is outstanding
    pending_ping: Option<Instant>,
    last_ping: Option<Instant>,
    last_data: Instant,
}

impl HeartbeatMonitor {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            pong_timeout: Duration::from_millis(config.pong_timeout_ms),
            stale_after: Duration::from_millis(config.stale_data_timeout_ms),
            pending_ping: None,
            last_ping: None,
            last_data: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.pending_ping = None;
        self.last_ping = None;
        self.last_data = Instant::now();
    }

    pub fn record_data_received(&mut self) {
        self.last_data = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        let now = Instant::now();
        self.pending_ping = Some(now);
        self.last_ping = Some(now);
    }

    pub fn record_pong_received(&mut self) {
        self.pending_ping = None;
    }

    pub fn check(&self) -> HeartbeatAction {
        let now = Instant::now();
        if let Some(sent) = self.pending_ping {
            if now.duration_since(sent) > self.pong_timeout {
                return HeartbeatAction::PongTimeout;
            }
        }
        if now.duration_since(self.last_data) > self.stale_after {
            return HeartbeatAction::DataStale;
        }
        let ping_due = self
            .last_ping
            .map_or(true, |sent| now.duration_since(sent) > self.ping_interval);
        if ping_due && self.pending_ping.is_none() {
            HeartbeatAction::SendPing
        } else {
            HeartbeatAction::Ok
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub streams_opened: AtomicU64,
    pub reconnects: AtomicU64,
    pub pong_timeouts: AtomicU64,
    pub stale_streams: AtomicU64,
    pub exhaustions: AtomicU64,
}

impl SessionMetrics {
    pub fn summary(&self) -> String {
        format!(
            "streams={} reconnects={} pong_timeouts={} stale={} exhausted={}",
            self.streams_opened.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.pong_timeouts.load(Ordering::Relaxed),
            self.stale_streams.load(Ordering::Relaxed),
            self.exhaustions.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    state: RwLock<SessionState>,
    state_tx: watch::Sender<SessionState>,
    backoff: Mutex<BackoffCalculator>,
    heartbeat: Mutex<HeartbeatMonitor>,
    streaming_since: Mutex<Option<Instant>>,
    metrics: SessionMetrics,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            backoff: Mutex::new(BackoffCalculator::new(&config)),
            heartbeat: Mutex::new(HeartbeatMonitor::new(&config)),
            streaming_since: Mutex::new(None),
            state: RwLock::new(SessionState::Idle),
            state_tx,
            metrics: SessionMetrics::default(),
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Receiver that observes every transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn transition(&self, new_state: SessionState, reason: TransitionReason) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);

        match new_state {
            SessionState::Streaming => {
                self.metrics.streams_opened.fetch_add(1, Ordering::Relaxed);
                self.heartbeat.lock().reset();
                *self.streaming_since.lock() = Some(Instant::now());
            }
            SessionState::Reconnecting => {
                self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                match reason {
                    TransitionReason::PongTimeout => {
                        self.metrics.pong_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    TransitionReason::DataStale => {
                        self.metrics.stale_streams.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                self.refund_budget_if_healthy();
            }
            SessionState::Failed => {
                self.metrics.exhaustions.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        self.state_tx.send_replace(new_state);
        info!(from = %old_state, to = %new_state, reason = %reason, "session_transition");
    }

    fn refund_budget_if_healthy(&self) {
        let Some(since) = self.streaming_since.lock().take() else {
            return;
        };
        let streamed = since.elapsed();
        if streamed >= Duration::from_millis(self.config.min_healthy_stream_ms) {
            self.backoff.lock().reset();
            debug!(streamed_ms = streamed.as_millis() as u64, "reconnect_budget_refunded");
        }
    }

    /// Prepare for a fresh subscription
    pub fn reset(&self) {
        self.backoff.lock().reset();
        self.heartbeat.lock().reset();
        *self.streaming_since.lock() = None;
    }

    pub fn next_backoff(&self) -> Duration {
        self.backoff.lock().next_backoff()
    }

    pub fn backoff_attempt(&self) -> u32 {
        self.backoff.lock().attempt()
    }

    pub fn retries_exhausted(&self) -> bool {
        self.backoff.lock().exhausted()
    }

    pub fn record_data_received(&self) {
        self.heartbeat.lock().record_data_received();
    }

    pub fn record_ping_sent(&self) {
        self.heartbeat.lock().record_ping_sent();
    }

    pub fn record_pong_received(&self) {
        self.heartbeat.lock().record_pong_received();
    }

    pub fn check_heartbeat(&self) -> HeartbeatAction {
        self.heartbeat.lock().check()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms)
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_factor: 0.3,
            max_reconnect_attempts: 3,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_backoff_sequence_without_jitter() {
        let mut backoff = BackoffCalculator::new(&SessionConfig {
            jitter_factor: 0.0,
            ..fast_config()
        });
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_backoff().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000]);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let mut backoff = BackoffCalculator::new(&fast_config());
        for _ in 0..50 {
            backoff.reset();
            let first = backoff.next_backoff().as_millis();
            assert!((70..=130).contains(&first), "first delay {}", first);
        }
        for _ in 0..20 {
            assert!(backoff.next_backoff().as_millis() <= 1_300);
        }
    }

    #[test]
    fn test_backoff_exhaustion() {
        let mut backoff = BackoffCalculator::new(&fast_config());
        assert!(!backoff.exhausted());
        for _ in 0..3 {
            backoff.next_backoff();
        }
        assert!(backoff.exhausted());
        backoff.reset();
        assert!(!backoff.exhausted());
    }

    #[test]
    fn test_heartbeat_ping_cycle() {
        let config = SessionConfig {
            ping_interval_ms: 100,
            stale_data_timeout_ms: 10_000,
            ..SessionConfig::default()
        };
        let mut monitor = HeartbeatMonitor::new(&config);

        assert_eq!(monitor.check(), HeartbeatAction::SendPing);
        monitor.record_ping_sent();
        assert_eq!(monitor.check(), HeartbeatAction::Ok);
        monitor.record_pong_received();
        assert_eq!(monitor.check(), HeartbeatAction::Ok);
    }

    #[test]
    fn test_heartbeat_pong_timeout() {
        let config = SessionConfig {
            pong_timeout_ms: 0,
            ..SessionConfig::default()
        };
        let mut monitor = HeartbeatMonitor::new(&config);
        monitor.record_ping_sent();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(monitor.check(), HeartbeatAction::PongTimeout);
    }

    #[test]
    fn test_heartbeat_data_stale() {
        let config = SessionConfig {
            stale_data_timeout_ms: 0,
            ..SessionConfig::default()
        };
        let monitor = HeartbeatMonitor::new(&config);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(monitor.check(), HeartbeatAction::DataStale);
    }

    #[test]
    fn test_transitions_publish_and_count() {
        let manager = SessionManager::new(fast_config());
        let rx = manager.subscribe();
        assert_eq!(manager.state(), SessionState::Idle);

        manager.transition(SessionState::Connecting, TransitionReason::Started);
        manager.transition(SessionState::Subscribing, TransitionReason::SubscribeSent);
        manager.transition(SessionState::Streaming, TransitionReason::FirstMessage);
        assert_eq!(*rx.borrow(), SessionState::Streaming);

        manager.transition(SessionState::Reconnecting, TransitionReason::DataStale);
        manager.transition(SessionState::Failed, TransitionReason::RetriesExhausted);
        assert!(manager.state().is_terminal());

        let m = manager.metrics();
        assert_eq!(m.streams_opened.load(Ordering::Relaxed), 1);
        assert_eq!(m.reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(m.stale_streams.load(Ordering::Relaxed), 1);
        assert_eq!(m.exhaustions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_short_lived_stream_keeps_spent_attempts() {
        let manager = SessionManager::new(SessionConfig {
            min_healthy_stream_ms: 60_000,
            ..fast_config()
        });
        manager.next_backoff();
        manager.next_backoff();

        manager.transition(SessionState::Streaming, TransitionReason::FirstMessage);
        assert_eq!(manager.backoff_attempt(), 2);
        manager.transition(SessionState::Reconnecting, TransitionReason::ServerClose);
        assert_eq!(manager.backoff_attempt(), 2);

        manager.next_backoff();
        assert!(manager.retries_exhausted());
    }

    #[test]
    fn test_healthy_stream_refunds_attempts() {
        let manager = SessionManager::new(SessionConfig {
            min_healthy_stream_ms: 0,
            ..fast_config()
        });
        manager.next_backoff();
        manager.next_backoff();

        manager.transition(SessionState::Streaming, TransitionReason::FirstMessage);
        manager.transition(SessionState::Reconnecting, TransitionReason::ServerClose);
        assert_eq!(manager.backoff_attempt(), 0);
    }
}
