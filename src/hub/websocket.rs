//! Hub side of the device WebSocket

use std::sync::Arc;

use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use super::HubState;

/// Optional query parameters for a device connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WsQuery {
    device_id: Option<String>,
}

/// Handle WebSocket upgrade request for `/ws/{session_id}`
pub(super) async fn ws_upgrade(
    State(state): State<Arc<HubState>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, query.device_id))
}

/// Pump frames between one device socket and its session room
async fn handle_socket(
    socket: WebSocket,
    state: Arc<HubState>,
    session_id: String,
    device_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (peer, mut rx) = state.join(&session_id, device_id.clone()).await;

    tracing::info!(
        session_id = %session_id,
        device_id = device_id.as_deref().unwrap_or("-"),
        "WebSocket connected"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = Arc::clone(&state);
    let recv_session = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    recv_state
                        .handle_frame(&recv_session, peer, text.as_str())
                        .await;
                }
                Message::Ping(data) => {
                    tracing::trace!(len = data.len(), "received ping");
                }
                Message::Close(_) => {
                    tracing::info!(session_id = %recv_session, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.leave(&session_id, peer).await;
}
