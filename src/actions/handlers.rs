//! Collaborator contracts and the handlers that adapt them to actions

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ActionHandler, ActionOutcome};
use crate::intent::PromisedAction;
use crate::{Error, Result};

/// Result of a wallet provisioning request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletProvision {
    Created { address: String },
    AlreadyExists { address: Option<String> },
}

/// Creates wallets on a chain
#[async_trait]
pub trait WalletProvisioner: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the provisioning service fails
    async fn create_wallet(&self, chain: &str) -> Result<WalletProvision>;
}

/// Receipt for a minted NFT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub asset_uri: String,
    pub transaction_hash: String,
    pub explorer_link: Option<String>,
}

/// Generates artwork from a description and mints it
#[async_trait]
pub trait NftMinter: Send + Sync {
    /// # Errors
    ///
    /// Returns an error carrying the failure reason
    async fn mint(&self, description: &str) -> Result<MintReceipt>;
}

/// Receipt for a token swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    pub transaction_hash: String,
}

/// Swaps tokens on a DEX
#[async_trait]
pub trait TokenSwapper: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the swap fails
    async fn swap(&self, from: &str, to: &str, amount: Option<f64>) -> Result<SwapReceipt>;
}

/// One row of transaction history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub hash: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
}

/// Read-only market and chain queries
#[async_trait]
pub trait MarketData: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the price is unavailable
    async fn token_price(&self, token: &str, base: &str) -> Result<f64>;

    /// # Errors
    ///
    /// Returns an error if history cannot be fetched
    async fn transaction_history(
        &self,
        address: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TransactionSummary>>;
}

const DEFAULT_HISTORY_LIMIT: usize = 5;

/// `create-wallet`
pub struct WalletHandler<P: ?Sized> {
    provisioner: Arc<P>,
}

impl<P: ?Sized> WalletHandler<P> {
    pub const fn new(provisioner: Arc<P>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl<P: WalletProvisioner + ?Sized> ActionHandler for WalletHandler<P> {
    async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome> {
        let chain = action.param("walletType").unwrap_or("ethereum");

        match self.provisioner.create_wallet(chain).await? {
            WalletProvision::Created { address } => Ok(ActionOutcome::new(format!(
                "Your {chain} wallet is ready: {address}"
            ))
            .with_details(serde_json::json!({ "walletType": chain, "address": address }))),
            WalletProvision::AlreadyExists { address } => {
                let summary = address.as_ref().map_or_else(
                    || format!("You already have a {chain} wallet."),
                    |a| format!("You already have a {chain} wallet: {a}"),
                );
                Ok(ActionOutcome::new(summary).with_details(
                    serde_json::json!({ "walletType": chain, "address": address, "existing": true }),
                ))
            }
        }
    }
}

/// `mint-nft`
pub struct NftHandler<M: ?Sized> {
    minter: Arc<M>,
}

impl<M: ?Sized> NftHandler<M> {
    pub const fn new(minter: Arc<M>) -> Self {
        Self { minter }
    }
}

#[async_trait]
impl<M: NftMinter + ?Sized> ActionHandler for NftHandler<M> {
    async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome> {
        let description = action
            .param("description")
            .ok_or_else(|| Error::Action("missing NFT description".to_string()))?;

        let receipt = self.minter.mint(description).await?;
        let link = receipt
            .explorer_link
            .clone()
            .unwrap_or_else(|| receipt.transaction_hash.clone());

        let mut outcome =
            ActionOutcome::new(format!("Minted your NFT \"{description}\". Transaction: {link}"))
                .with_details(serde_json::to_value(&receipt)?);
        if !receipt.asset_uri.is_empty() {
            outcome = outcome.with_image(receipt.asset_uri);
        }

        Ok(outcome)
    }
}

/// `swap-tokens`
pub struct SwapHandler<S: ?Sized> {
    swapper: Arc<S>,
}

impl<S: ?Sized> SwapHandler<S> {
    pub const fn new(swapper: Arc<S>) -> Self {
        Self { swapper }
    }
}

#[async_trait]
impl<S: TokenSwapper + ?Sized> ActionHandler for SwapHandler<S> {
    async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome> {
        let from = action.param("fromToken").unwrap_or("SONIC");
        let to = action.param("toToken").unwrap_or("ETH");
        let amount = action
            .param("amount")
            .map(str::parse::<f64>)
            .transpose()
            .map_err(|e| Error::Action(format!("invalid swap amount: {e}")))?;

        let receipt = self.swapper.swap(from, to, amount).await?;

        Ok(ActionOutcome::new(format!(
            "Swapped {from} to {to}. Transaction: {}",
            receipt.transaction_hash
        ))
        .with_details(serde_json::json!({
            "fromToken": from,
            "toToken": to,
            "amount": amount,
            "transactionHash": receipt.transaction_hash,
        })))
    }
}

/// `get-token-price`
pub struct PriceHandler<D: ?Sized> {
    market: Arc<D>,
}

impl<D: ?Sized> PriceHandler<D> {
    pub const fn new(market: Arc<D>) -> Self {
        Self { market }
    }
}

#[async_trait]
impl<D: MarketData + ?Sized> ActionHandler for PriceHandler<D> {
    async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome> {
        let token = action.param("token").unwrap_or("SONIC");
        let base = action.param("base").unwrap_or("USD");

        let price = self.market.token_price(token, base).await?;

        Ok(
            ActionOutcome::new(format!("{token} is trading at {price:.4} {base}"))
                .with_details(serde_json::json!({ "token": token, "base": base, "price": price })),
        )
    }
}

/// `get-transaction-history`
pub struct HistoryHandler<D: ?Sized> {
    market: Arc<D>,
}

impl<D: ?Sized> HistoryHandler<D> {
    pub const fn new(market: Arc<D>) -> Self {
        Self { market }
    }
}

#[async_trait]
impl<D: MarketData + ?Sized> ActionHandler for HistoryHandler<D> {
    async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome> {
        let address = action.param("address");
        let limit = action
            .param("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(DEFAULT_HISTORY_LIMIT);

        let transactions = self.market.transaction_history(address, limit).await?;

        let summary = if transactions.is_empty() {
            "No recent transactions found.".to_string()
        } else {
            let lines: Vec<String> = transactions
                .iter()
                .map(|t| match t.value {
                    Some(v) => format!("- {} ({v})", t.hash),
                    None => format!("- {}", t.hash),
                })
                .collect();
            format!(
                "Your last {} transactions:\n{}",
                transactions.len(),
                lines.join("\n")
            )
        };

        Ok(ActionOutcome::new(summary).with_details(serde_json::to_value(&transactions)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{ActionKind, Parameters};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChain {
        wallets: Mutex<Vec<String>>,
        swaps: Mutex<Vec<(String, String, Option<f64>)>>,
    }

    #[async_trait]
    impl WalletProvisioner for FakeChain {
        async fn create_wallet(&self, chain: &str) -> Result<WalletProvision> {
            let mut wallets = self.wallets.lock().unwrap();
            if wallets.iter().any(|c| c == chain) {
                return Ok(WalletProvision::AlreadyExists { address: None });
            }
            wallets.push(chain.to_string());
            Ok(WalletProvision::Created {
                address: "0xabc".to_string(),
            })
        }
    }

    #[async_trait]
    impl NftMinter for FakeChain {
        async fn mint(&self, description: &str) -> Result<MintReceipt> {
            if description.is_empty() {
                return Err(Error::Action("empty description".to_string()));
            }
            Ok(MintReceipt {
                asset_uri: "ipfs://cat".to_string(),
                transaction_hash: "0xtx".to_string(),
                explorer_link: None,
            })
        }
    }

    #[async_trait]
    impl TokenSwapper for FakeChain {
        async fn swap(&self, from: &str, to: &str, amount: Option<f64>) -> Result<SwapReceipt> {
            self.swaps
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string(), amount));
            Ok(SwapReceipt {
                transaction_hash: "0xswap".to_string(),
            })
        }
    }

    #[async_trait]
    impl MarketData for FakeChain {
        async fn token_price(&self, _token: &str, _base: &str) -> Result<f64> {
            Ok(0.5)
        }

        async fn transaction_history(
            &self,
            _address: Option<&str>,
            limit: usize,
        ) -> Result<Vec<TransactionSummary>> {
            Ok((0..limit)
                .map(|i| TransactionSummary {
                    hash: format!("0x{i}"),
                    from: None,
                    to: None,
                    value: None,
                })
                .collect())
        }
    }

    fn action(kind: ActionKind, pairs: &[(&str, &str)]) -> PromisedAction {
        let params: Parameters = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        PromisedAction::new(kind, 0.9, params)
    }

    #[tokio::test]
    async fn wallet_reports_existing_wallet() {
        let chain = Arc::new(FakeChain::default());
        let handler = WalletHandler::new(Arc::clone(&chain));
        let create = action(ActionKind::CreateWallet, &[("walletType", "ethereum")]);

        let first = handler.execute(&create).await.unwrap();
        let second = handler.execute(&create).await.unwrap();

        assert!(first.summary.contains("0xabc"));
        assert!(second.summary.contains("already have"));
    }

    #[tokio::test]
    async fn nft_outcome_carries_image() {
        let handler = NftHandler::new(Arc::new(FakeChain::default()));
        let outcome = handler
            .execute(&action(ActionKind::MintNft, &[("description", "a cat")]))
            .await
            .unwrap();

        assert_eq!(outcome.image_url.as_deref(), Some("ipfs://cat"));
        assert!(outcome.summary.contains("0xtx"));
    }

    #[tokio::test]
    async fn nft_requires_description() {
        let handler = NftHandler::new(Arc::new(FakeChain::default()));
        assert!(handler.execute(&action(ActionKind::MintNft, &[])).await.is_err());
    }

    #[tokio::test]
    async fn swap_parses_amount() {
        let chain = Arc::new(FakeChain::default());
        let handler = SwapHandler::new(Arc::clone(&chain));
        handler
            .execute(&action(
                ActionKind::SwapTokens,
                &[("fromToken", "USDC"), ("toToken", "ETH"), ("amount", "2.5")],
            ))
            .await
            .unwrap();

        let swaps = chain.swaps.lock().unwrap();
        assert_eq!(swaps[0], ("USDC".to_string(), "ETH".to_string(), Some(2.5)));
    }

    #[tokio::test]
    async fn swap_rejects_bad_amount() {
        let handler = SwapHandler::new(Arc::new(FakeChain::default()));
        let result = handler
            .execute(&action(ActionKind::SwapTokens, &[("amount", "lots")]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn history_honours_limit() {
        let handler = HistoryHandler::new(Arc::new(FakeChain::default()));
        let outcome = handler
            .execute(&action(ActionKind::GetTransactionHistory, &[("limit", "2")]))
            .await
            .unwrap();
        assert!(outcome.summary.starts_with("Your last 2 transactions"));
    }

    #[tokio::test]
    async fn price_formats_quote() {
        let handler = PriceHandler::new(Arc::new(FakeChain::default()));
        let outcome = handler
            .execute(&action(ActionKind::GetTokenPrice, &[("token", "ETH")]))
            .await
            .unwrap();
        assert_eq!(outcome.summary, "ETH is trading at 0.5000 USD");
    }
}
