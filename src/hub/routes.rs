//! Health and session inspection endpoints

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use serde_json::{Map, Value};

use super::HubState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

/// Stored history of one session
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub session_id: String,
    pub messages: Vec<Map<String, Value>>,
    pub actions: Vec<Map<String, Value>>,
}

/// Devices announced in one session
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesResponse {
    pub session_id: String,
    pub active_devices: Vec<String>,
}

pub(super) async fn health(State(state): State<Arc<HubState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.session_count().await,
    })
}

pub(super) async fn session_messages(
    State(state): State<Arc<HubState>>,
    Path(session_id): Path<String>,
) -> Json<MessagesResponse> {
    let messages = state.messages(&session_id).await;
    let actions = state.actions(&session_id).await;
    Json(MessagesResponse {
        session_id,
        messages,
        actions,
    })
}

pub(super) async fn session_devices(
    State(state): State<Arc<HubState>>,
    Path(session_id): Path<String>,
) -> Json<DevicesResponse> {
    let active_devices = state.devices(&session_id).await;
    Json(DevicesResponse {
        session_id,
        active_devices,
    })
}
