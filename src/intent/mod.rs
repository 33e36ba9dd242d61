//! Promised-action detection
//!
//! Heuristic classifiers that map an assistant utterance to candidate
//! "the assistant just promised to do X" actions. Scores are hand-tuned
//! confidence tiers, not calibrated probabilities.
//!
//! Detectors are registered in a [`DetectorRegistry`]; new action kinds can be
//! supported by registering another [`IntentDetector`] without touching the
//! arbitrator.

mod rules;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use rules::{
    BASE_CONFIDENCE, ConfidenceTier, DetectionRule, PROMISE_INDICATORS, RuleDetector, TierPolicy,
    default_rules,
};

/// Extracted action arguments, compared structurally
pub type Parameters = BTreeMap<String, String>;

/// The fixed set of actions the assistant can promise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CreateWallet,
    MintNft,
    SwapTokens,
    GetTokenPrice,
    GetTransactionHistory,
}

impl ActionKind {
    pub const ALL: [Self; 5] = [
        Self::CreateWallet,
        Self::MintNft,
        Self::SwapTokens,
        Self::GetTokenPrice,
        Self::GetTransactionHistory,
    ];

    /// Wire name of this action kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateWallet => "create-wallet",
            Self::MintNft => "mint-nft",
            Self::SwapTokens => "swap-tokens",
            Self::GetTokenPrice => "get-token-price",
            Self::GetTransactionHistory => "get-transaction-history",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    /// Parse a wire name. Also accepts the backend's legacy aliases
    /// (`nft_generation`, `swap-sonic`, ...).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "create-wallet" | "wallet-creation" | "create-wallet-directly" => Ok(Self::CreateWallet),
            "mint-nft" | "nft-generation" => Ok(Self::MintNft),
            "swap-tokens" | "swap-sonic" | "token-swap" => Ok(Self::SwapTokens),
            "get-token-price" | "token-price" => Ok(Self::GetTokenPrice),
            "get-transaction-history" | "transaction-history" => Ok(Self::GetTransactionHistory),
            other => Err(Error::Detector(format!("unknown action kind: {other}"))),
        }
    }
}

/// Where a candidate was extracted from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedIn {
    /// Index of the source message in the context window
    pub message_index: usize,
    /// Confidence at detection time
    pub confidence: f64,
}

/// A candidate inferred obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromisedAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Heuristic confidence in `[0, 1]`
    pub probability: f64,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_in: Option<DetectedIn>,
}

impl PromisedAction {
    #[must_use]
    pub const fn new(kind: ActionKind, probability: f64, parameters: Parameters) -> Self {
        Self {
            kind,
            probability,
            parameters,
            detected_in: None,
        }
    }

    /// Return this action attributed to a context window message
    #[must_use]
    pub const fn detected_at(mut self, message_index: usize) -> Self {
        self.detected_in = Some(DetectedIn {
            message_index,
            confidence: self.probability,
        });
        self
    }

    /// Dedup identity: same kind and structurally equal parameters
    #[must_use]
    pub fn same_action(&self, other: &Self) -> bool {
        self.kind == other.kind && self.parameters == other.parameters
    }

    /// Look up an extracted parameter
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    fn is_well_formed(&self) -> bool {
        self.probability.is_finite() && (0.0..=1.0).contains(&self.probability)
    }
}

/// A pluggable classifier for one action kind
pub trait IntentDetector: Send + Sync {
    /// The action kind this detector produces
    fn kind(&self) -> ActionKind;

    /// Inspect an assistant utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the detector cannot evaluate the text; callers
    /// treat this as "no match".
    fn detect(&self, text: &str) -> Result<Option<PromisedAction>>;
}

/// Ordered, extensible set of detectors
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn IntentDetector>>,
}

impl fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field(
                "kinds",
                &self.detectors.iter().map(|d| d.kind()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl DetectorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one rule detector per built-in action kind
    #[must_use]
    pub fn with_defaults(policy: TierPolicy) -> Self {
        let mut registry = Self::new();
        for rule in default_rules() {
            registry.register(RuleDetector::new(rule, policy));
        }
        registry
    }

    /// Add a detector; it runs after those already registered
    pub fn register(&mut self, detector: impl IntentDetector + 'static) {
        self.detectors.push(Arc::new(detector));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run every detector against `text`.
    ///
    /// Failing detectors and malformed results are logged and skipped.
    #[must_use]
    pub fn detect_all(&self, text: &str) -> Vec<PromisedAction> {
        let mut found = Vec::new();

        for detector in &self.detectors {
            match detector.detect(text) {
                Ok(Some(action)) if action.is_well_formed() => {
                    tracing::debug!(
                        kind = %action.kind,
                        probability = action.probability,
                        "promised action detected"
                    );
                    found.push(action);
                }
                Ok(Some(action)) => {
                    tracing::warn!(
                        kind = %detector.kind(),
                        probability = action.probability,
                        "detector returned out-of-range probability, ignoring"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(kind = %detector.kind(), error = %e, "detector failed");
                }
            }
        }

        found
    }
}
