//! Conversation turns and action usage records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One conversational turn
///
/// Immutable once created. Only the containing window mutates, by insertion
/// and eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message body
    pub text: String,
    /// `true` when authored by the human, `false` for the assistant
    pub is_user: bool,
    /// Creation instant; part of the dedup key
    pub timestamp: DateTime<Utc>,
    /// Attached image (generated NFT artwork, etc)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Marks assistant messages reporting a failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Originating device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Originating session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatMessage {
    /// A message typed or spoken by the user, stamped now
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text, true)
    }

    /// A message produced by the assistant, stamped now
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(text, false)
    }

    /// An error-flagged assistant message
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(text)
        }
    }

    fn new(text: impl Into<String>, is_user: bool) -> Self {
        Self {
            text: text.into(),
            is_user,
            timestamp: Utc::now(),
            image_url: None,
            is_error: false,
            device_id: None,
            session_id: None,
        }
    }

    /// Return this message with an explicit timestamp
    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Return this message with an attached image
    #[must_use]
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Return this message tagged with its device/session provenance
    #[must_use]
    pub fn with_origin(mut self, device_id: &str, session_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Observational record of an executed action, shown in the
/// multi-device "what just happened" feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionUsage {
    /// Action name (e.g. `create-wallet`)
    pub name: String,
    /// Human-readable summary
    pub description: String,
    /// When the action ran
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ActionUsage {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            timestamp: Utc::now(),
            device_id: None,
            session_id: None,
        }
    }

    /// Return this record tagged with its device/session provenance
    #[must_use]
    pub fn with_origin(mut self, device_id: &str, session_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self.session_id = Some(session_id.to_string());
        self
    }
}
