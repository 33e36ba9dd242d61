//! Wire envelope shared by devices and the relay hub

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Recognized event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ActionUsed,
    NewMessage,
    VoiceCommand,
    ContextUpdate,
    ToolUsed,
    SessionJoined,
    SessionLeft,
    /// Sent by the hub to a newly connected device before history replay
    SessionInfo,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ActionUsed => "action_used",
            Self::NewMessage => "new_message",
            Self::VoiceCommand => "voice_command",
            Self::ContextUpdate => "context_update",
            Self::ToolUsed => "tool_used",
            Self::SessionJoined => "session_joined",
            Self::SessionLeft => "session_left",
            Self::SessionInfo => "session_info",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| Error::MalformedEvent(format!("unknown event type: {s}")))
    }
}

/// `{ type, payload: { ..., deviceId, sessionId, timestamp } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    #[must_use]
    pub const fn new(event_type: EventType, payload: Map<String, Value>) -> Self {
        Self {
            event_type,
            payload,
        }
    }

    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] if the frame is not a valid envelope
    pub fn parse(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::MalformedEvent(e.to_string()))
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload value cannot be serialized
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Stamp provenance fields. A caller-supplied timestamp is kept.
    pub fn stamp(&mut self, device_id: &str, session_id: &str) {
        self.payload
            .insert("deviceId".to_string(), Value::String(device_id.to_string()));
        self.payload.insert(
            "sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
        if !self.payload.get("timestamp").is_some_and(|t| !t.is_null()) {
            self.payload.insert(
                "timestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
    }

    /// Originating device, if stamped
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.payload.get("deviceId").and_then(Value::as_str)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.payload.get("sessionId").and_then(Value::as_str)
    }

    /// Decode the payload into a typed record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] if the payload does not match `T`
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| Error::MalformedEvent(format!("{} payload: {e}", self.event_type)))
    }
}

/// Convert a serializable record into an envelope payload.
///
/// # Errors
///
/// Returns an error if `value` does not serialize to a JSON object
pub fn to_payload<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::MalformedEvent(format!(
            "payload must be an object, got {other}"
        ))),
    }
}
