//! Agent backend contract
//!
//! The backend takes the latest user text and answers with assistant text,
//! optionally a structured action it has already decided on, and a log of
//! prior turns. Declared actions skip heuristic detection and enter the
//! candidate set at full confidence.

mod bridge;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::context::ChatMessage;
use crate::intent::{ActionKind, Parameters, PromisedAction};
use crate::{Error, Result};

pub use bridge::{CallBridge, CallTurn};

/// Confidence assigned to actions the backend declares explicitly
pub const DECLARED_ACTION_PROBABILITY: f64 = 1.0;

/// One entry of the backend's turn log
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TurnLog {
    #[serde(alias = "text")]
    pub message: String,
    #[serde(default, alias = "isUser")]
    pub is_user: bool,
}

impl TurnLog {
    #[must_use]
    pub fn to_message(&self) -> ChatMessage {
        if self.is_user {
            ChatMessage::user(self.message.clone())
        } else {
            ChatMessage::assistant(self.message.clone())
        }
    }
}

/// A structured action attached to an agent reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAction {
    pub name: String,
    pub params: Parameters,
}

impl BackendAction {
    /// Candidate for the arbitrator, or `None` for kinds this engine
    /// cannot execute
    #[must_use]
    pub fn to_promised(&self) -> Option<PromisedAction> {
        let kind = self.name.parse::<ActionKind>().ok()?;
        let mut params = self.params.clone();
        // The backend calls the chain type `chain_type`
        if let Some(chain) = params.remove("chain_type") {
            params.entry("walletType".to_string()).or_insert(chain);
        }
        Some(PromisedAction::new(kind, DECLARED_ACTION_PROBABILITY, params))
    }
}

/// Agent response for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub response: String,
    pub action: Option<BackendAction>,
    pub logs: Vec<TurnLog>,
}

impl AgentReply {
    #[must_use]
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            action: None,
            logs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: BackendAction) -> Self {
        self.action = Some(action);
        self
    }

    #[must_use]
    pub fn with_logs(mut self, logs: Vec<TurnLog>) -> Self {
        self.logs = logs;
        self
    }

    /// Decode the backend's chat response body.
    ///
    /// The action is either an object (`{"type": "...", ...params}`) or a
    /// bare name with its parameters as siblings of `response`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Agent`] if the backend reported an error or the
    /// body has no response text
    pub fn from_body(body: &Value) -> Result<Self> {
        let status = body.get("status").and_then(Value::as_str).unwrap_or("success");
        if status != "success" {
            let detail = body
                .get("detail")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("agent returned an error");
            return Err(Error::Agent(detail.to_string()));
        }

        let response = body
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Agent("reply has no response text".to_string()))?
            .to_string();

        let action = match body.get("action") {
            Some(Value::Object(fields)) => fields
                .get("type")
                .and_then(Value::as_str)
                .map(|name| BackendAction {
                    name: name.to_string(),
                    params: flatten_params(fields, &["type"]),
                }),
            Some(Value::String(name)) => body.as_object().map(|fields| BackendAction {
                name: name.clone(),
                params: flatten_params(fields, &["status", "response", "action", "logs"]),
            }),
            _ => None,
        };

        let logs = body
            .get("logs")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            response,
            action,
            logs,
        })
    }
}

/// Scalar fields as string parameters; nested objects are dropped
fn flatten_params(fields: &Map<String, Value>, skip: &[&str]) -> Parameters {
    fields
        .iter()
        .filter(|(k, _)| !skip.contains(&k.as_str()))
        .filter_map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), value))
        })
        .collect()
}

/// The conversational agent
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or reports a failure
    async fn chat(&self, message: &str) -> Result<AgentReply>;
}

/// [`AgentBackend`] over `POST /agent/chat`
#[derive(Debug, Clone)]
pub struct HttpAgentBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgentBackend {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn chat(&self, message: &str) -> Result<AgentReply> {
        let url = format!("{}/agent/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!("chat failed ({status}): {text}")));
        }

        let body: Value = response.json().await?;
        let reply = AgentReply::from_body(&body)?;

        tracing::debug!(
            has_action = reply.action.is_some(),
            logs = reply.logs.len(),
            "agent replied"
        );

        Ok(reply)
    }
}
