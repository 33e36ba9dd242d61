//! Periodic history re-fetch from the relay hub

use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::context::{ActionUsage, ChatMessage};
use crate::session::DeviceSession;
use crate::{Error, Result};

/// Body of `GET /sessions/{id}/messages`
#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    actions: Vec<serde_json::Value>,
}

/// A session's stored messages and action records, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub messages: Vec<ChatMessage>,
    pub actions: Vec<ActionUsage>,
}

/// Decode what we can; count the rest
fn decode_all<T: serde::de::DeserializeOwned>(values: Vec<serde_json::Value>) -> (Vec<T>, usize) {
    let total = values.len();
    let decoded: Vec<T> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    let skipped = total - decoded.len();
    (decoded, skipped)
}

/// HTTP base for a hub WebSocket URL (`ws://` → `http://`, `wss://` → `https://`)
#[must_use]
pub fn http_base(ws_url: &str) -> String {
    let url = ws_url.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}

/// Fetches a session's message history from the hub
#[derive(Debug, Clone)]
pub struct HistoryPoller {
    base_url: String,
    client: reqwest::Client,
}

impl HistoryPoller {
    /// Create a poller for a hub at `base_url` (`http://` or `ws://`)
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: http_base(base_url),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch the current history of `session_id`.
    ///
    /// Entries that do not decode as messages or action records are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the hub answers non-2xx
    pub async fn fetch(&self, session_id: &str) -> Result<History> {
        let url = format!(
            "{}/sessions/{}/messages",
            self.base_url,
            urlencoding::encode(session_id)
        );

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Transport(format!("history fetch failed ({status})")));
        }

        let body: HistoryResponse = response.json().await?;
        let (messages, skipped_messages) = decode_all(body.messages);
        let (actions, skipped_actions) = decode_all(body.actions);

        if skipped_messages + skipped_actions > 0 {
            tracing::debug!(
                skipped_messages,
                skipped_actions,
                "skipped undecodable history entries"
            );
        }

        Ok(History { messages, actions })
    }

    /// Poll every `period` and merge into `session` until the session
    /// leaves `session_id` or the task is aborted
    #[must_use]
    pub fn spawn(
        self,
        session: DeviceSession,
        session_id: String,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                // Offline is fine (history still helps); another session is not
                if session
                    .channel()
                    .session_id()
                    .is_some_and(|current| current != session_id)
                {
                    break;
                }

                match self.fetch(&session_id).await {
                    Ok(history) => {
                        session.apply_polled(history.messages);
                        session.apply_polled_actions(history.actions);
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %session_id, error = %e, "history poll failed");
                    }
                }
            }
        })
    }
}
