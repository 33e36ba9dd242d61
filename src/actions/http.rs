//! HTTP client for the assistant backend's action surface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    MarketData, MintReceipt, NftMinter, SwapReceipt, TokenSwapper, TransactionSummary,
    WalletProvision, WalletProvisioner,
};
use crate::{Error, Result};

/// Connection name the backend routes chain actions through
const CHAIN_CONNECTION: &str = "sonic";

/// Client for the backend's REST endpoints
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ActionRequest<'a> {
    connection: &'a str,
    action: &'a str,
    params: Vec<Value>,
}

/// `{"status": "success", "result": ...}` or `{"status": "error", "detail": ...}`
#[derive(Debug, Deserialize)]
struct ActionResponse {
    status: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MintResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    explorer_link: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl BackendClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a named chain action through `POST /agent/action`
    async fn perform(&self, action: &str, params: Value) -> Result<Value> {
        let url = format!("{}/agent/action", self.base_url);
        let body = ActionRequest {
            connection: CHAIN_CONNECTION,
            action,
            params: vec![params],
        };

        tracing::debug!(action, "calling backend action");
        let response = self.client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Action(format!("{action} failed ({status}): {text}")));
        }

        let parsed: ActionResponse = response.json().await?;
        if parsed.status != "success" {
            return Err(Error::Action(
                parsed
                    .detail
                    .unwrap_or_else(|| format!("{action} returned status {}", parsed.status)),
            ));
        }
        if parsed.result.is_null() {
            return Err(Error::Action(format!("{action} returned no result")));
        }

        Ok(parsed.result)
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl WalletProvisioner for BackendClient {
    async fn create_wallet(&self, chain: &str) -> Result<WalletProvision> {
        match self.perform("create-wallet", json!(chain)).await {
            Ok(result) => {
                let address = string_field(&result, &["address", "wallet_address"])
                    .ok_or_else(|| Error::Action("wallet response missing address".to_string()))?;
                Ok(WalletProvision::Created { address })
            }
            Err(Error::Action(detail)) if detail.to_lowercase().contains("already") => {
                Ok(WalletProvision::AlreadyExists { address: None })
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl NftMinter for BackendClient {
    async fn mint(&self, description: &str) -> Result<MintReceipt> {
        let url = format!("{}/api/mint-nft", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "description": description }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Action(format!("mint failed ({status})")));
        }

        let parsed: MintResponse = response.json().await?;
        if !parsed.success {
            return Err(Error::Action(
                parsed.error.unwrap_or_else(|| "mint was not successful".to_string()),
            ));
        }

        let transaction_hash = parsed
            .transaction_hash
            .ok_or_else(|| Error::Action("mint response missing transaction hash".to_string()))?;

        Ok(MintReceipt {
            asset_uri: parsed.uri.unwrap_or_default(),
            transaction_hash,
            explorer_link: parsed.explorer_link,
        })
    }
}

#[async_trait]
impl TokenSwapper for BackendClient {
    async fn swap(&self, from: &str, to: &str, amount: Option<f64>) -> Result<SwapReceipt> {
        let mut params = json!({ "token_in": from, "token_out": to });
        if let Some(amount) = amount {
            params["amount"] = json!(amount);
        }

        let result = self.perform("swap-sonic", params).await?;
        let transaction_hash = result
            .as_str()
            .map(str::to_string)
            .or_else(|| string_field(&result, &["transaction_hash", "tx_hash", "hash"]))
            .ok_or_else(|| Error::Action("swap response missing transaction hash".to_string()))?;

        Ok(SwapReceipt { transaction_hash })
    }
}

#[async_trait]
impl MarketData for BackendClient {
    async fn token_price(&self, token: &str, base: &str) -> Result<f64> {
        let result = self
            .perform(
                "get-token-price",
                json!({ "token_address": token, "base_currency": base }),
            )
            .await?;

        result
            .as_f64()
            .or_else(|| result.get("price").and_then(Value::as_f64))
            .ok_or_else(|| Error::Action(format!("no price returned for {token}")))
    }

    async fn transaction_history(
        &self,
        address: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TransactionSummary>> {
        let mut params = json!({ "limit": limit });
        if let Some(address) = address {
            params["address"] = json!(address);
        }

        let result = self.perform("get-transaction-history", params).await?;
        Ok(serde_json::from_value(result)?)
    }
}
