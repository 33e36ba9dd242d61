//! Link establishment
//!
//! A [`Connector`] opens one bidirectional text link to a named session. The
//! link is a pair of channels so the reconnect state machine never touches
//! the socket directly: dropping `outbound` closes the link, and `inbound`
//! yielding `None` means the remote side went away.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::{Error, Result};

/// An open link to a session
#[derive(Debug)]
pub struct Link {
    /// Frames to transmit
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames received; closes when the link drops
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `session_id` on behalf of `device_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be established
    async fn open(&self, session_id: &str, device_id: &str) -> Result<Link>;
}

/// Connects to a relay hub over WebSocket (`{base_url}/ws/{session}`)
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for a hub at `base_url` (e.g. `ws://localhost:8765`)
    #[must_use]
    pub fn new(base_url: &str, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            connect_timeout,
        }
    }

    fn session_url(&self, session_id: &str, device_id: &str) -> String {
        format!(
            "{}/ws/{}?deviceId={}",
            self.base_url,
            urlencoding::encode(session_id),
            urlencoding::encode(device_id)
        )
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, session_id: &str, device_id: &str) -> Result<Link> {
        let url = self.session_url(session_id, device_id);

        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Transport(format!("connect to {url} timed out")))??;

        tracing::debug!(url = %url, "websocket link open");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(text) = outgoing else {
                            // Local side dropped the link
                            let _ = sink.close().await;
                            break;
                        };
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::warn!(error = %e, "websocket send failed");
                            break;
                        }
                    }
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "websocket receive failed");
                            break;
                        }
                    },
                }
            }
            tracing::debug!("websocket link closed");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
