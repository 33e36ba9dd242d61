//! Action execution
//!
//! The arbitrator decides *which* promise to keep; this module keeps it by
//! dispatching to an [`ActionHandler`] registered for the action kind.
//! Handlers adapt narrow collaborator contracts (wallet provisioning, NFT
//! minting, market data, swaps) whose implementations live behind HTTP.

mod handlers;
mod http;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::intent::{ActionKind, PromisedAction};
use crate::{Error, Result};

pub use handlers::{
    HistoryHandler, MarketData, MintReceipt, NftHandler, NftMinter, PriceHandler, SwapHandler,
    SwapReceipt, TokenSwapper, TransactionSummary, WalletHandler, WalletProvision,
    WalletProvisioner,
};
pub use http::BackendClient;

/// What an executed action produced, for the conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    /// Assistant-facing summary
    pub summary: String,
    /// Generated artwork, if any
    pub image_url: Option<String>,
    /// Structured result for the action feed
    pub details: serde_json::Value,
}

impl ActionOutcome {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            image_url: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Executes one kind of promised action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the external side effect failed
    async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome>;
}

/// Handlers keyed by action kind
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        f.debug_struct("ActionRegistry").field("kinds", &kinds).finish()
    }
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind backed by the HTTP backend
    #[must_use]
    pub fn with_backend(client: &BackendClient) -> Self {
        let client = Arc::new(client.clone());
        let mut registry = Self::new();
        registry.register(
            ActionKind::CreateWallet,
            WalletHandler::new(Arc::clone(&client)),
        );
        registry.register(ActionKind::MintNft, NftHandler::new(Arc::clone(&client)));
        registry.register(ActionKind::SwapTokens, SwapHandler::new(Arc::clone(&client)));
        registry.register(
            ActionKind::GetTokenPrice,
            PriceHandler::new(Arc::clone(&client)),
        );
        registry.register(
            ActionKind::GetTransactionHistory,
            HistoryHandler::new(client),
        );
        registry
    }

    /// Register (or replace) the handler for a kind
    pub fn register(&mut self, kind: ActionKind, handler: impl ActionHandler + 'static) {
        if self.handlers.insert(kind, Arc::new(handler)).is_some() {
            tracing::debug!(%kind, "replaced action handler");
        }
    }

    #[must_use]
    pub fn has(&self, kind: ActionKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Execute an action with its registered handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoHandler`] if nothing handles the kind, or the
    /// handler's own error
    pub async fn dispatch(&self, action: &PromisedAction) -> Result<ActionOutcome> {
        let handler = self
            .handlers
            .get(&action.kind)
            .ok_or_else(|| Error::NoHandler(action.kind.to_string()))?;

        tracing::info!(
            kind = %action.kind,
            probability = action.probability,
            parameters = ?action.parameters,
            "dispatching promised action"
        );

        handler.execute(action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Parameters;

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome> {
            Ok(ActionOutcome::new(format!("ran {}", action.kind)))
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut registry = ActionRegistry::new();
        registry.register(ActionKind::GetTokenPrice, Echo);

        let action = PromisedAction::new(ActionKind::GetTokenPrice, 0.9, Parameters::new());
        let outcome = registry.dispatch(&action).await.unwrap();

        assert_eq!(outcome.summary, "ran get-token-price");
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let registry = ActionRegistry::new();
        let action = PromisedAction::new(ActionKind::MintNft, 0.9, Parameters::new());

        let err = registry.dispatch(&action).await.unwrap_err();
        assert!(matches!(err, Error::NoHandler(kind) if kind == "mint-nft"));
    }

    #[test]
    fn backend_registry_covers_every_kind() {
        let client = BackendClient::new("http://localhost:8000");
        let registry = ActionRegistry::with_backend(&client);
        assert!(ActionKind::ALL.iter().all(|k| registry.has(*k)));
    }
}
