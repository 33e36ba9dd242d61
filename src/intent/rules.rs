//! Rule-table detectors
//!
//! Each action kind is described by a [`DetectionRule`]: keyword phrases that
//! must appear, an ordered list of strong phrasings with fixed confidence
//! tiers, and a parameter extractor. A rule fires only when one of its
//! keywords AND one of the shared [`PROMISE_INDICATORS`] are present.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ActionKind, IntentDetector, Parameters, PromisedAction};
use crate::Result;

/// Phrases signalling that the assistant commits to doing something
pub const PROMISE_INDICATORS: &[&str] = &[
    "for you",
    "right away",
    "right now",
    "immediately",
    "let me",
    "i'll",
    "i will",
];

/// Confidence assigned when no strong phrasing matches
pub const BASE_CONFIDENCE: f64 = 0.70;

/// How to pick a confidence when several strong phrasings match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierPolicy {
    /// The last matching tier in table order wins
    #[default]
    LastMatch,
    /// The highest matching tier wins
    Highest,
}

/// A strong phrasing and the confidence it implies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceTier {
    pub phrase: &'static str,
    pub confidence: f64,
}

const fn tier(phrase: &'static str, confidence: f64) -> ConfidenceTier {
    ConfidenceTier { phrase, confidence }
}

/// Signature of a parameter extractor: `(original text, lower-cased text)`
pub type Extractor = fn(&str, &str) -> Parameters;

/// Deterministic detection table for one action kind
#[derive(Debug, Clone, Copy)]
pub struct DetectionRule {
    pub kind: ActionKind,
    /// At least one must be present (lower-case)
    pub keywords: &'static [&'static str],
    /// Evaluated in order (lower-case)
    pub tiers: &'static [ConfidenceTier],
    pub extract: Extractor,
}

impl DetectionRule {
    /// Confidence for already lower-cased text under the given policy
    #[must_use]
    pub fn confidence(&self, lower: &str, policy: TierPolicy) -> f64 {
        let matched = self
            .tiers
            .iter()
            .filter(|t| lower.contains(t.phrase))
            .map(|t| t.confidence);

        let picked = match policy {
            TierPolicy::LastMatch => matched.last(),
            TierPolicy::Highest => matched.reduce(f64::max),
        };

        picked.unwrap_or(BASE_CONFIDENCE)
    }
}

/// [`IntentDetector`] driven by a [`DetectionRule`]
#[derive(Debug, Clone, Copy)]
pub struct RuleDetector {
    rule: DetectionRule,
    policy: TierPolicy,
}

impl RuleDetector {
    #[must_use]
    pub const fn new(rule: DetectionRule, policy: TierPolicy) -> Self {
        Self { rule, policy }
    }
}

impl IntentDetector for RuleDetector {
    fn kind(&self) -> ActionKind {
        self.rule.kind
    }

    fn detect(&self, text: &str) -> Result<Option<PromisedAction>> {
        let lower = normalize(text);

        let has_keyword = self.rule.keywords.iter().any(|k| lower.contains(k));
        let has_promise = PROMISE_INDICATORS.iter().any(|p| lower.contains(p));
        if !(has_keyword && has_promise) {
            return Ok(None);
        }

        let probability = self.rule.confidence(&lower, self.policy);
        let parameters = (self.rule.extract)(text, &lower);

        Ok(Some(PromisedAction::new(
            self.rule.kind,
            probability,
            parameters,
        )))
    }
}

/// Lower-case and fold typographic apostrophes so "I’ll" matches "i'll"
fn normalize(text: &str) -> String {
    text.to_lowercase().replace('\u{2019}', "'")
}

/// The built-in rule table, one rule per [`ActionKind`]
#[must_use]
pub const fn default_rules() -> [DetectionRule; 5] {
    DEFAULT_RULES
}

const DEFAULT_RULES: [DetectionRule; 5] = [
    DetectionRule {
        kind: ActionKind::CreateWallet,
        keywords: &[
            "create a wallet",
            "set up a wallet",
            "make a wallet",
            "generate a wallet",
            "create a new wallet",
            "create your wallet",
        ],
        tiers: &[
            tier("let me create a wallet", 0.85),
            tier("i'll create a wallet", 0.85),
            tier("create a wallet for you", 0.90),
            tier("i will create a wallet for you", 0.95),
            tier("i'll create a wallet for you", 0.95),
        ],
        extract: wallet_params,
    },
    DetectionRule {
        kind: ActionKind::MintNft,
        keywords: &[
            "mint an nft",
            "mint the nft",
            "mint your nft",
            "create an nft",
            "create your nft",
            "generate an nft",
            "generate your nft",
            "make an nft",
        ],
        tiers: &[
            tier("let me create an nft", 0.85),
            tier("i'll generate an nft", 0.90),
            tier("i'll mint", 0.90),
            tier("i will mint an nft for you", 0.95),
            tier("i'll create an nft for you", 0.95),
        ],
        extract: nft_params,
    },
    DetectionRule {
        kind: ActionKind::SwapTokens,
        keywords: &["swap", "exchange your tokens", "convert your tokens"],
        tiers: &[
            tier("let me swap", 0.85),
            tier("i'll swap", 0.90),
            tier("i will swap", 0.90),
            tier("i'll perform the swap for you", 0.95),
        ],
        extract: swap_params,
    },
    DetectionRule {
        kind: ActionKind::GetTokenPrice,
        keywords: &[
            "check the price",
            "get the price",
            "look up the price",
            "fetch the price",
            "current price",
            "price of",
        ],
        tiers: &[
            tier("let me check the price", 0.85),
            tier("i'll check the price", 0.90),
            tier("i'll get the current price", 0.95),
        ],
        extract: price_params,
    },
    DetectionRule {
        kind: ActionKind::GetTransactionHistory,
        keywords: &[
            "transaction history",
            "recent transactions",
            "past transactions",
            "your transactions",
        ],
        tiers: &[
            tier("let me check your transaction history", 0.85),
            tier("i'll check your transaction history", 0.90),
            tier("i'll fetch your transaction history", 0.95),
        ],
        extract: history_params,
    },
];

static NFT_DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:of|with|showing|depicting|based on)\s+["“'](.+?)["”']"#)
        .expect("valid regex")
});

static SWAP_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i:swap)\s+(?:(?i:your|the|some|my)\s+)?(?:([0-9]+(?:\.[0-9]+)?)\s+)?\$?([A-Z][A-Z0-9]{1,9})\b\s+(?i:to|for|into)\s+\$?([A-Z][A-Z0-9]{1,9})\b",
    )
    .expect("valid regex")
});

static SWAP_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?i:to|for|into)\s+\$?([A-Z][A-Z0-9]{1,9})\b").expect("valid regex")
});

static PRICE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i:price\s+of)\s+\$?([A-Z][A-Z0-9]{1,9})\b").expect("valid regex")
});

static PRICE_BASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bin\s+(usd|eur|eth|btc)\b").expect("valid regex"));

static ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]{40}").expect("valid regex"));

static HISTORY_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\blast\s+(\d{1,3})\s+transactions").expect("valid regex")
});

const DEFAULT_NFT_DESCRIPTION: &str = "Abstract digital art";
const DEFAULT_SWAP_FROM: &str = "SONIC";
const DEFAULT_SWAP_TO: &str = "ETH";
const DEFAULT_PRICE_TOKEN: &str = "SONIC";
const DEFAULT_PRICE_BASE: &str = "USD";

fn params<const N: usize>(pairs: [(&str, String); N]) -> Parameters {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn wallet_params(_text: &str, lower: &str) -> Parameters {
    let chain = if lower.contains("cardano") {
        "cardano"
    } else {
        "ethereum"
    };
    params([("walletType", chain.to_string())])
}

fn nft_params(text: &str, _lower: &str) -> Parameters {
    let description = NFT_DESCRIPTION
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or_else(|| DEFAULT_NFT_DESCRIPTION.to_string(), |m| m.as_str().trim().to_string());
    params([("description", description)])
}

fn swap_params(text: &str, _lower: &str) -> Parameters {
    if let Some(caps) = SWAP_PAIR.captures(text) {
        let mut out = params([
            ("fromToken", caps[2].to_string()),
            ("toToken", caps[3].to_string()),
        ]);
        if let Some(amount) = caps.get(1) {
            out.insert("amount".to_string(), amount.as_str().to_string());
        }
        return out;
    }

    let to = SWAP_TARGET
        .captures(text)
        .map_or_else(|| DEFAULT_SWAP_TO.to_string(), |c| c[1].to_string());
    params([
        ("fromToken", DEFAULT_SWAP_FROM.to_string()),
        ("toToken", to),
    ])
}

fn price_params(text: &str, _lower: &str) -> Parameters {
    let token = PRICE_TOKEN
        .captures(text)
        .map_or_else(|| DEFAULT_PRICE_TOKEN.to_string(), |c| c[1].to_string());
    let base = PRICE_BASE
        .captures(text)
        .map_or_else(|| DEFAULT_PRICE_BASE.to_string(), |c| c[1].to_uppercase());
    params([("token", token), ("base", base)])
}

fn history_params(text: &str, _lower: &str) -> Parameters {
    let mut out = Parameters::new();
    if let Some(m) = ADDRESS.find(text) {
        out.insert("address".to_string(), m.as_str().to_string());
    }
    if let Some(c) = HISTORY_LIMIT.captures(text) {
        out.insert("limit".to_string(), c[1].to_string());
    }
    out
}
