//! Feed connection against a local WebSocket server
//!
//! The server accepts any number of connections, forwards the subscribe
//! request it receives on each, pushes a fixed list of frames and then either
//! holds the connection open until the client goes away or closes it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use reachwatch_backend::feed::{FeedConnection, SessionConfig, SessionState, UpdateHandler};
use reachwatch_backend::models::{RouteUpdate, SubscriptionSpec, UpdateKind};

struct ChannelHandler(mpsc::UnboundedSender<RouteUpdate>);

#[async_trait]
impl UpdateHandler for ChannelHandler {
    async fn handle(&self, update: RouteUpdate) {
        let _ = self.0.send(update);
    }
}

async fn spawn_server(frames: Vec<String>) -> (String, mpsc::UnboundedReceiver<String>) {
    spawn_server_with(frames, true).await
}

async fn spawn_server_with(
    frames: Vec<String>,
    hold_open: bool,
) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (sub_tx, sub_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let frames = frames.clone();
            let sub_tx = sub_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                if let Some(Ok(Message::Text(sub))) = ws.next().await {
                    let _ = sub_tx.send(sub);
                }
                for frame in frames {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                if !hold_open {
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });

    (format!("ws://{}", addr), sub_rx)
}

fn connection(url: &str, config: SessionConfig) -> (FeedConnection, mpsc::UnboundedReceiver<RouteUpdate>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FeedConnection::new(url, config, Arc::new(ChannelHandler(tx))), rx)
}

const ANNOUNCE_FRAME: &str = r#"{"type":"ris_message","data":{"timestamp":1700000000.0,"peer":"192.0.2.1","host":"rrc01",
    "path":[3333,64500],"announcements":[{"prefixes":["203.0.113.0/24"]}]}}"#;

fn spec(prefix: &str) -> SubscriptionSpec {
    SubscriptionSpec::new(vec![prefix.to_string()], false)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting")
        .expect("channel closed")
}

#[tokio::test]
async fn test_subscribes_and_delivers_updates_past_bad_frames() {
    let frames = vec![
        "this is not json".to_string(),
        r#"{"type":"ris_message","data":{"timestamp":1700000000.0,"peer":"192.0.2.1","host":"rrc01",
            "path":[3333,64500],"announcements":[{"prefixes":["203.0.113.0/24"]}]}}"#
            .to_string(),
        r#"{"type":"ris_message","data":{"peer":"192.0.2.1","host":"rrc01","withdrawals":["203.0.113.0/24"]}}"#
            .to_string(),
    ];
    let (url, mut subs) = spawn_server(frames).await;
    let (feed, mut updates) = connection(&url, SessionConfig::default());

    feed.start(spec("203.0.113.0/24")).await;

    let sub: serde_json::Value = serde_json::from_str(&recv(&mut subs).await).unwrap();
    assert_eq!(sub["type"], "ris_subscribe");
    assert_eq!(sub["data"]["prefix"][0], "203.0.113.0/24");

    let first = recv(&mut updates).await;
    assert_eq!(first.kind, UpdateKind::Announce);
    assert_eq!(first.origin_id.as_deref(), Some("64500"));
    assert_eq!(first.vantage_point, "192.0.2.1@rrc01");

    let second = recv(&mut updates).await;
    assert_eq!(second.kind, UpdateKind::Withdraw);

    assert_eq!(feed.stats().decode_errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(feed.state(), SessionState::Streaming);

    feed.stop().await;
    assert_eq!(feed.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_restart_replaces_subscription() {
    let (url, mut subs) = spawn_server(vec![]).await;
    let (feed, _updates) = connection(&url, SessionConfig::default());

    feed.start(spec("203.0.113.0/24")).await;
    assert!(recv(&mut subs).await.contains("203.0.113.0/24"));

    feed.start(spec("198.51.100.0/24")).await;
    let second = recv(&mut subs).await;
    assert!(second.contains("198.51.100.0/24"));
    assert!(!second.contains("203.0.113.0/24"));
    assert_eq!(feed.current_spec().await, Some(spec("198.51.100.0/24")));

    feed.stop().await;
    assert_eq!(feed.current_spec().await, None);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (url, mut subs) = spawn_server(vec![]).await;
    let (feed, _updates) = connection(&url, SessionConfig::default());

    feed.stop().await;
    feed.start(spec("203.0.113.0/24")).await;
    recv(&mut subs).await;
    feed.stop().await;
    feed.stop().await;
    assert_eq!(feed.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_unreachable_feed_fails_after_bounded_retries() {
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = SessionConfig {
        backoff_base_ms: 10,
        backoff_max_ms: 20,
        max_reconnect_attempts: 2,
        connect_timeout_ms: 500,
        ..SessionConfig::default()
    };
    let (feed, _updates) = connection(&format!("ws://127.0.0.1:{}", port), config);

    feed.start(spec("203.0.113.0/24")).await;
    let mut state = feed.state_watch();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == SessionState::Failed))
        .await
        .expect("feed should give up")
        .unwrap();

    assert!(feed.session().metrics().exhaustions.load(std::sync::atomic::Ordering::Relaxed) >= 1);

    // Stopping a failed feed keeps the terminal state
    feed.stop().await;
    assert_eq!(feed.state(), SessionState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_and_stop_on_multi_thread_runtime() {
    let (url, mut subs) = spawn_server(vec![ANNOUNCE_FRAME.to_string()]).await;
    let (feed, mut updates) = connection(&url, SessionConfig::default());

    feed.start(spec("203.0.113.0/24")).await;
    recv(&mut subs).await;
    assert_eq!(recv(&mut updates).await.kind, UpdateKind::Announce);

    feed.stop().await;
    assert_eq!(feed.state(), SessionState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flapping_feed_still_exhausts_reconnect_budget() {
    // Every connection delivers one update and is then closed by the server
    let (url, _subs) = spawn_server_with(vec![ANNOUNCE_FRAME.to_string()], false).await;
    let config = SessionConfig {
        backoff_base_ms: 10,
        backoff_max_ms: 20,
        max_reconnect_attempts: 2,
        min_healthy_stream_ms: 60_000,
        ..SessionConfig::default()
    };
    let (feed, mut updates) = connection(&url, config);

    feed.start(spec("203.0.113.0/24")).await;
    let mut state = feed.state_watch();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == SessionState::Failed))
        .await
        .expect("flapping feed should give up")
        .unwrap();

    // At most one stream per attempt: the initial connection plus two retries
    let streams = feed.session().metrics().streams_opened.load(std::sync::atomic::Ordering::Relaxed);
    assert!(streams <= 3, "streams opened: {}", streams);
    let mut delivered = 0;
    while updates.try_recv().is_ok() {
        delivered += 1;
    }
    assert!(delivered <= 3);
}
