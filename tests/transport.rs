//! Transport integration tests
//!
//! Drives a [`SyncChannel`] over an in-memory connector with paused time so
//! the reconnect schedule can be asserted exactly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, json};
use sonicline::transport::{ConnectionState, Envelope, EventType, SyncChannel};
use tokio::sync::mpsc;

mod common;
use common::{MemoryConnector, of_type, remote_frame, test_policy};

fn channel(connector: &Arc<MemoryConnector>) -> SyncChannel {
    SyncChannel::new("dev-a", connector.clone(), test_policy())
}

fn assert_close(actual: Duration, expected: Duration) {
    let diff = actual.abs_diff(expected);
    assert!(
        diff <= Duration::from_millis(5),
        "expected ~{expected:?}, got {actual:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_follows_backoff_then_gives_up() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);
    assert!(channel.connect("room").await);

    connector.set_failing(true);
    connector.sever(0);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let opens = connector.open_times();
    assert_eq!(opens.len(), 6, "initial open plus five retries");

    let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
    let expected = [1000, 1500, 2250, 3375, 5062];
    for (gap, ms) in gaps.iter().zip(expected) {
        assert_close(*gap, Duration::from_millis(ms));
    }

    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_rejoins_after_drop() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);
    assert!(channel.connect("room").await);
    connector.sent(0);

    connector.sever(0);
    tokio::task::yield_now().await;
    assert_eq!(channel.state(), ConnectionState::Reconnecting);
    assert_eq!(channel.reconnect_attempts(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(channel.is_connected());
    assert_eq!(channel.reconnect_attempts(), 0);
    assert_eq!(connector.link_count(), 2);

    let frames = connector.sent(1);
    assert_eq!(of_type(&frames, "session_joined").len(), 1);
}

#[tokio::test]
async fn test_connect_is_idempotent_for_same_session() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);

    assert!(channel.connect("room").await);
    assert!(channel.connect("room").await);

    assert_eq!(connector.open_times().len(), 1);
    assert_eq!(channel.session_id().as_deref(), Some("room"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connect_reports_in_flight() {
    let connector = MemoryConnector::new();
    connector.set_open_delay(Duration::from_millis(100));
    let channel = channel(&connector);

    let (first, second) = tokio::join!(channel.connect("room"), channel.connect("room"));

    assert!(first);
    assert!(!second);
    assert_eq!(connector.open_times().len(), 1);
}

#[tokio::test]
async fn test_connect_announces_session_joined() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);
    assert!(channel.connect("room").await);

    let frames = connector.sent(0);
    let joined = of_type(&frames, "session_joined");
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0]["payload"]["deviceId"], "dev-a");
    assert_eq!(joined[0]["payload"]["sessionId"], "room");
    assert!(joined[0]["payload"]["timestamp"].is_string());
}

#[tokio::test]
async fn test_send_event_requires_connection() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);

    assert!(!channel.send_event(EventType::NewMessage, Map::new()));

    assert!(channel.connect("room").await);
    let mut payload = Map::new();
    payload.insert("text".to_string(), json!("hello"));
    assert!(channel.send_event(EventType::NewMessage, payload));

    let frames = connector.sent(0);
    let messages = of_type(&frames, "new_message");
    assert_eq!(messages[0]["payload"]["text"], "hello");
    assert_eq!(messages[0]["payload"]["deviceId"], "dev-a");
}

#[tokio::test]
async fn test_switching_sessions_leaves_previous() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);

    assert!(channel.connect("first").await);
    connector.sent(0);
    assert!(channel.connect("second").await);

    let farewell = connector.sent(0);
    assert_eq!(of_type(&farewell, "session_left").len(), 1);
    assert!(connector.device_closed(0));
    assert_eq!(connector.opened_sessions(), vec!["first", "second"]);
    assert_eq!(channel.session_id().as_deref(), Some("second"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_retry() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);
    assert!(channel.connect("room").await);

    connector.sever(0);
    tokio::task::yield_now().await;
    assert_eq!(channel.state(), ConnectionState::Reconnecting);

    channel.disconnect();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(connector.open_times().len(), 1);

    // Repeated disconnects are harmless
    channel.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_failure_does_not_retry() {
    let connector = MemoryConnector::new();
    connector.set_failing(true);
    let channel = channel(&connector);

    assert!(!channel.connect("room").await);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(connector.open_times().len(), 1);
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);
    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.on(EventType::NewMessage, move |env| {
        let _ = tx.send(env.payload.get("text").cloned());
    });
    assert!(channel.connect("room").await);

    connector.inject(0, "not json at all");
    connector.inject(0, r#"{"type":"no_such_event","payload":{}}"#);
    connector.inject(0, &remote_frame("new_message", &json!({ "text": "still alive" })));

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("listener not called")
        .flatten();
    assert_eq!(received, Some(json!("still alive")));
    assert!(rx.try_recv().is_err());
    assert!(channel.is_connected());
}

#[test]
fn test_panicking_listener_does_not_starve_others() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);
    let calls = Arc::new(AtomicUsize::new(0));

    channel.on(EventType::ActionUsed, |_| panic!("listener bug"));
    let counter = Arc::clone(&calls);
    channel.on(EventType::ActionUsed, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let event = Envelope::new(EventType::ActionUsed, Map::new());
    channel.dispatch(&event);
    channel.dispatch(&event);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_off_unregisters_listener() {
    let connector = MemoryConnector::new();
    let channel = channel(&connector);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let id = channel.on(EventType::NewMessage, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    channel.dispatch(&Envelope::new(EventType::NewMessage, Map::new()));

    assert!(channel.off(EventType::NewMessage, id));
    assert!(!channel.off(EventType::NewMessage, id));
    channel.dispatch(&Envelope::new(EventType::NewMessage, Map::new()));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_tears_down_new_link() {
    let connector = MemoryConnector::new();
    connector.set_open_delay(Duration::from_millis(100));
    let channel = channel(&connector);

    let (connected, ()) = tokio::join!(channel.connect("room"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.disconnect();
    });

    assert!(!connected);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(connector.link_count(), 1);
    assert!(connector.device_closed(0));
}
