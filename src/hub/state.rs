//! Shared hub state: one room per session

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

use crate::transport::EventType;

/// Default number of messages (and actions) kept per session
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Default idle time after which an empty session is dropped
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default period of the idle sweep
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Hub limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    pub history_cap: usize,
    pub idle_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            history_cap: DEFAULT_HISTORY_CAP,
            idle_ttl: DEFAULT_IDLE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Identifies one socket within the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

#[derive(Debug)]
struct Peer {
    device_id: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
struct SessionRoom {
    peers: HashMap<PeerId, Peer>,
    devices: Vec<String>,
    messages: VecDeque<Map<String, Value>>,
    actions: VecDeque<Map<String, Value>>,
    last_activity: Instant,
}

impl SessionRoom {
    fn new() -> Self {
        Self {
            peers: HashMap::new(),
            devices: Vec::new(),
            messages: VecDeque::new(),
            actions: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn broadcast(&self, frame: &str, exclude: Option<PeerId>) {
        for (id, peer) in &self.peers {
            if Some(*id) == exclude {
                continue;
            }
            // A closed peer is removed by its own socket task
            let _ = peer.tx.send(frame.to_string());
        }
    }

    fn presence_frame(
        &self,
        event_type: EventType,
        session_id: &str,
        payload: &Map<String, Value>,
    ) -> String {
        json!({
            "type": event_type,
            "payload": {
                "deviceId": payload.get("deviceId"),
                "timestamp": payload
                    .get("timestamp")
                    .cloned()
                    .unwrap_or_else(|| json!(chrono::Utc::now().to_rfc3339())),
                "sessionId": session_id,
                "activeDevices": self.devices,
            }
        })
        .to_string()
    }
}

fn push_capped(history: &mut VecDeque<Map<String, Value>>, item: Map<String, Value>, cap: usize) {
    history.push_back(item);
    while history.len() > cap {
        history.pop_front();
    }
}

fn frame(event_type: EventType, payload: &Map<String, Value>) -> String {
    json!({ "type": event_type, "payload": payload }).to_string()
}

/// Sessions, their peers and their replayable history
#[derive(Debug)]
pub struct HubState {
    sessions: RwLock<HashMap<String, SessionRoom>>,
    settings: HubSettings,
    next_peer: AtomicU64,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new(HubSettings::default())
    }
}

impl HubState {
    #[must_use]
    pub fn new(settings: HubSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            next_peer: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Register a socket with a session.
    ///
    /// The returned receiver already holds `session_info` followed by the
    /// stored messages and actions, so a new peer sees history before any
    /// live traffic.
    pub async fn join(
        &self,
        session_id: &str,
        device_id: Option<String>,
    ) -> (PeerId, mpsc::UnboundedReceiver<String>) {
        let id = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut sessions = self.sessions.write().await;
        let room = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionRoom::new);
        room.touch();

        let info = json!({
            "type": EventType::SessionInfo,
            "payload": {
                "sessionId": session_id,
                "activeDevices": room.devices,
                "messageCount": room.messages.len(),
                "actionCount": room.actions.len(),
            }
        });
        let _ = tx.send(info.to_string());
        for message in &room.messages {
            let _ = tx.send(frame(EventType::NewMessage, message));
        }
        for action in &room.actions {
            let _ = tx.send(frame(EventType::ActionUsed, action));
        }

        room.peers.insert(id, Peer { device_id, tx });

        tracing::info!(
            session_id,
            peers = room.peers.len(),
            "peer connected to session"
        );

        (id, rx)
    }

    /// Remove a socket. History is kept for reconnecting devices.
    pub async fn leave(&self, session_id: &str, peer: PeerId) {
        let mut sessions = self.sessions.write().await;
        let Some(room) = sessions.get_mut(session_id) else {
            return;
        };
        let Some(gone) = room.peers.remove(&peer) else {
            return;
        };

        // Drop the device from presence unless another socket still carries it
        if let Some(device_id) = gone.device_id {
            let still_present = room
                .peers
                .values()
                .any(|p| p.device_id.as_deref() == Some(device_id.as_str()));
            if !still_present {
                room.devices.retain(|d| *d != device_id);
            }
        }

        tracing::info!(
            session_id,
            remaining = room.peers.len(),
            "peer disconnected from session"
        );
    }

    /// Apply one inbound text frame from `peer`
    pub async fn handle_frame(&self, session_id: &str, peer: PeerId, text: &str) {
        let mut sessions = self.sessions.write().await;
        let Some(room) = sessions.get_mut(session_id) else {
            return;
        };
        room.touch();

        let Ok(data) = serde_json::from_str::<Value>(text) else {
            tracing::warn!(session_id, "invalid JSON received");
            if let Some(sender) = room.peers.get(&peer) {
                let _ = sender.tx.send(json!({ "error": "Invalid JSON format" }).to_string());
            }
            return;
        };

        let Some(kind) = data.get("type").and_then(Value::as_str) else {
            tracing::warn!(session_id, "event without type");
            return;
        };
        let payload = data
            .get("payload")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let Ok(event_type) = kind.parse::<EventType>() else {
            room.broadcast(text, Some(peer));
            return;
        };

        match event_type {
            EventType::SessionJoined => {
                if let Some(device_id) = payload.get("deviceId").and_then(Value::as_str)
                    && !room.devices.iter().any(|d| d == device_id)
                {
                    room.devices.push(device_id.to_string());
                    tracing::info!(session_id, device_id, "device joined session");
                }
                let update = room.presence_frame(event_type, session_id, &payload);
                room.broadcast(&update, None);
            }
            EventType::SessionLeft => {
                if let Some(device_id) = payload.get("deviceId").and_then(Value::as_str) {
                    room.devices.retain(|d| d != device_id);
                    tracing::info!(session_id, device_id, "device left session");
                }
                let update = room.presence_frame(event_type, session_id, &payload);
                room.broadcast(&update, None);
            }
            EventType::NewMessage => {
                push_capped(&mut room.messages, payload.clone(), self.settings.history_cap);
                room.broadcast(&frame(event_type, &payload), Some(peer));
            }
            EventType::ActionUsed => {
                push_capped(&mut room.actions, payload.clone(), self.settings.history_cap);
                room.broadcast(&frame(event_type, &payload), Some(peer));
            }
            _ => room.broadcast(text, Some(peer)),
        }
    }

    /// Stored message payloads for a session, oldest first
    pub async fn messages(&self, session_id: &str) -> Vec<Map<String, Value>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|room| room.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored action payloads for a session, oldest first
    pub async fn actions(&self, session_id: &str) -> Vec<Map<String, Value>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|room| room.actions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Devices currently announced in a session
    pub async fn devices(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|room| room.devices.clone())
            .unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions with no peers and no activity for the idle TTL.
    /// Returns the number removed.
    pub async fn cleanup_idle(&self) -> usize {
        let ttl = self.settings.idle_ttl;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|session_id, room| {
            let keep = !room.peers.is_empty() || room.last_activity.elapsed() <= ttl;
            if !keep {
                tracing::info!(session_id = %session_id, "cleaning up inactive session");
            }
            keep
        });

        before - sessions.len()
    }
}
