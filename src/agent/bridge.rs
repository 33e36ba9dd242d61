//! Voice call adapter
//!
//! An inbound call takes turns with the agent exactly like a chat session,
//! but is keyed by the telephony provider's call id. Each live call gets
//! its own context window; it is dropped when the call ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::AgentBackend;
use crate::Result;
use crate::arbitration::DEFAULT_THRESHOLD;
use crate::context::{ChatMessage, ContextLimits, ContextWindow};
use crate::intent::{DetectorRegistry, PromisedAction};

/// What the caller hears back, plus the action to run (if any)
#[derive(Debug, Clone, PartialEq)]
pub struct CallTurn {
    pub reply: String,
    pub action: Option<PromisedAction>,
}

/// Per-call turn taking against an [`AgentBackend`]
pub struct CallBridge {
    backend: Arc<dyn AgentBackend>,
    detectors: DetectorRegistry,
    limits: ContextLimits,
    threshold: f64,
    calls: Mutex<HashMap<String, ContextWindow>>,
}

impl CallBridge {
    #[must_use]
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        detectors: DetectorRegistry,
        limits: ContextLimits,
    ) -> Self {
        Self {
            backend,
            detectors,
            limits,
            threshold: DEFAULT_THRESHOLD,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Minimum confidence for a detected action to be returned
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Handle one recognised utterance from a caller.
    ///
    /// A declared backend action wins; otherwise the reply is run through
    /// the detectors and the most confident match is returned if it
    /// reaches the threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent backend fails
    pub async fn handle_utterance(&self, call_id: &str, speech: &str) -> Result<CallTurn> {
        self.with_call(call_id, |window| {
            window.add_message(ChatMessage::user(speech));
        });

        let reply = self.backend.chat(speech).await?;

        let action = reply
            .action
            .as_ref()
            .and_then(super::BackendAction::to_promised)
            .or_else(|| {
                self.detectors
                    .detect_all(&reply.response)
                    .into_iter()
                    .max_by(|a, b| a.probability.total_cmp(&b.probability))
            })
            .filter(|action| action.probability >= self.threshold);

        let index = self.with_call(call_id, |window| {
            window.add_message(ChatMessage::assistant(reply.response.clone()))
        });

        tracing::debug!(call_id, action = ?action.as_ref().map(|a| a.kind), "call turn");

        Ok(CallTurn {
            reply: reply.response,
            action: action.map(|a| a.detected_at(index)),
        })
    }

    /// Forget a finished call
    pub fn end_call(&self, call_id: &str) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(call_id)
            .is_some()
    }

    /// Number of calls with live context
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Transcript of a live call
    #[must_use]
    pub fn transcript(&self, call_id: &str) -> Vec<ChatMessage> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(call_id)
            .map(|w| w.messages().cloned().collect())
            .unwrap_or_default()
    }

    fn with_call<R>(&self, call_id: &str, f: impl FnOnce(&mut ContextWindow) -> R) -> R {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let window = calls.entry(call_id.to_string()).or_insert_with(|| {
            let mut window = ContextWindow::new(self.limits);
            window.init_context(call_id);
            window
        });
        f(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentReply, BackendAction};
    use crate::intent::{ActionKind, Parameters, TierPolicy};
    use async_trait::async_trait;

    struct Scripted;

    #[async_trait]
    impl AgentBackend for Scripted {
        async fn chat(&self, message: &str) -> Result<AgentReply> {
            if message.contains("wallet") {
                return Ok(AgentReply::text("On it.").with_action(BackendAction {
                    name: "create-wallet".to_string(),
                    params: Parameters::new(),
                }));
            }
            Ok(AgentReply::text("I'll check the price of SONIC for you"))
        }
    }

    fn bridge() -> CallBridge {
        CallBridge::new(
            Arc::new(Scripted),
            DetectorRegistry::with_defaults(TierPolicy::default()),
            ContextLimits::default(),
        )
    }

    #[tokio::test]
    async fn declared_action_wins() {
        let bridge = bridge();
        let turn = bridge.handle_utterance("CA1", "make me a wallet").await.unwrap();

        let action = turn.action.unwrap();
        assert_eq!(action.kind, ActionKind::CreateWallet);
        assert_eq!(action.detected_in.unwrap().message_index, 1);
    }

    #[tokio::test]
    async fn reply_text_is_detected() {
        let bridge = bridge();
        let turn = bridge.handle_utterance("CA1", "what's sonic worth").await.unwrap();
        assert_eq!(turn.action.unwrap().kind, ActionKind::GetTokenPrice);
    }

    #[tokio::test]
    async fn tentative_reply_yields_no_action() {
        struct Tentative;

        #[async_trait]
        impl AgentBackend for Tentative {
            async fn chat(&self, _message: &str) -> Result<AgentReply> {
                Ok(AgentReply::text("Let me know if you want me to create a wallet."))
            }
        }

        let bridge = CallBridge::new(
            Arc::new(Tentative),
            DetectorRegistry::with_defaults(TierPolicy::default()),
            ContextLimits::default(),
        );
        let turn = bridge.handle_utterance("CA1", "hi").await.unwrap();
        assert!(turn.action.is_none());

        let lenient = CallBridge::new(
            Arc::new(Tentative),
            DetectorRegistry::with_defaults(TierPolicy::default()),
            ContextLimits::default(),
        )
        .with_threshold(0.5);
        let turn = lenient.handle_utterance("CA1", "hi").await.unwrap();
        assert_eq!(turn.action.unwrap().kind, ActionKind::CreateWallet);
    }

    #[tokio::test]
    async fn calls_are_isolated_and_ended() {
        let bridge = bridge();
        bridge.handle_utterance("CA1", "hello").await.unwrap();
        bridge.handle_utterance("CA2", "hello").await.unwrap();

        assert_eq!(bridge.active_calls(), 2);
        assert_eq!(bridge.transcript("CA1").len(), 2);

        assert!(bridge.end_call("CA1"));
        assert!(!bridge.end_call("CA1"));
        assert!(bridge.transcript("CA1").is_empty());
    }
}
