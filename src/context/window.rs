//! Bounded rolling conversation memory for one session

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::message::ChatMessage;

/// Default number of retained messages
pub const DEFAULT_MAX_MESSAGES: usize = 20;

/// Default number of retained facts
pub const DEFAULT_MAX_FACTS: usize = 10;

/// What `init_context` does with stored user preferences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceRetention {
    /// Keep preferences across session (re)opens
    #[default]
    Retain,
    /// Clear preferences along with history and facts
    Reset,
}

/// Limits and reset behaviour for a [`ContextWindow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_messages: usize,
    pub max_facts: usize,
    pub preferences: PreferenceRetention,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_facts: DEFAULT_MAX_FACTS,
            preferences: PreferenceRetention::Retain,
        }
    }
}

/// Per-session conversational memory
///
/// History and facts are FIFO-truncated, never summarized.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    session_id: Option<String>,
    messages: VecDeque<ChatMessage>,
    facts: VecDeque<String>,
    preferences: HashMap<String, serde_json::Value>,
    limits: ContextLimits,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(ContextLimits::default())
    }
}

impl ContextWindow {
    /// Create an empty window with the given limits
    #[must_use]
    pub fn new(limits: ContextLimits) -> Self {
        Self {
            session_id: None,
            messages: VecDeque::with_capacity(limits.max_messages + 1),
            facts: VecDeque::with_capacity(limits.max_facts + 1),
            preferences: HashMap::new(),
            limits,
        }
    }

    /// Reset history and facts for a (re)opened session
    pub fn init_context(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
        self.messages.clear();
        self.facts.clear();
        if self.limits.preferences == PreferenceRetention::Reset {
            self.preferences.clear();
        }
        tracing::debug!(
            session_id,
            retention = ?self.limits.preferences,
            "context initialized"
        );
    }

    /// Append a message, evicting the oldest beyond the limit.
    ///
    /// Returns the post-eviction index of the appended message.
    pub fn add_message(&mut self, message: ChatMessage) -> usize {
        self.messages.push_back(message);
        while self.messages.len() > self.limits.max_messages {
            self.messages.pop_front();
        }
        self.messages.len().saturating_sub(1)
    }

    /// Record a fact unless an identical one is already stored.
    ///
    /// Returns `true` if the fact was added.
    pub fn add_relevant_fact(&mut self, fact: impl Into<String>) -> bool {
        let fact = fact.into();
        if self.facts.contains(&fact) {
            return false;
        }
        self.facts.push_back(fact);
        while self.facts.len() > self.limits.max_facts {
            self.facts.pop_front();
        }
        true
    }

    /// Upsert a preference (last write wins)
    pub fn set_user_preference(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.preferences.insert(key.into(), value);
    }

    #[must_use]
    pub fn user_preference(&self, key: &str) -> Option<&serde_json::Value> {
        self.preferences.get(key)
    }

    #[must_use]
    pub const fn preferences(&self) -> &HashMap<String, serde_json::Value> {
        &self.preferences
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Retained messages, oldest first
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    #[must_use]
    pub fn message(&self, index: usize) -> Option<&ChatMessage> {
        self.messages.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Retained facts, oldest first
    pub fn relevant_facts(&self) -> impl Iterator<Item = &str> {
        self.facts.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> ChatMessage {
        ChatMessage::user(format!("message {n}"))
    }

    #[test]
    fn keeps_most_recent_twenty_in_order() {
        let mut window = ContextWindow::default();
        for n in 1..=21 {
            window.add_message(numbered(n));
        }

        assert_eq!(window.len(), 20);
        let texts: Vec<_> = window.messages().map(|m| m.text.clone()).collect();
        let expected: Vec<_> = (2..=21).map(|n| format!("message {n}")).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn never_exceeds_limit() {
        let mut window = ContextWindow::default();
        for n in 0..100 {
            let index = window.add_message(numbered(n));
            assert!(window.len() <= DEFAULT_MAX_MESSAGES);
            assert_eq!(index, window.len() - 1);
        }
    }

    #[test]
    fn returns_post_eviction_index() {
        let mut window = ContextWindow::new(ContextLimits {
            max_messages: 3,
            ..ContextLimits::default()
        });
        assert_eq!(window.add_message(numbered(0)), 0);
        assert_eq!(window.add_message(numbered(1)), 1);
        assert_eq!(window.add_message(numbered(2)), 2);
        assert_eq!(window.add_message(numbered(3)), 2);
        assert_eq!(window.message(2).unwrap().text, "message 3");
    }

    #[test]
    fn facts_reject_duplicates() {
        let mut window = ContextWindow::default();
        assert!(window.add_relevant_fact("user has a wallet"));
        assert!(!window.add_relevant_fact("user has a wallet"));
        assert_eq!(window.relevant_facts().count(), 1);
    }

    #[test]
    fn facts_keep_most_recent_ten() {
        let mut window = ContextWindow::default();
        for n in 0..15 {
            window.add_relevant_fact(format!("fact {n}"));
        }
        let facts: Vec<_> = window.relevant_facts().collect();
        assert_eq!(facts.len(), 10);
        assert_eq!(facts[0], "fact 5");
        assert_eq!(facts[9], "fact 14");
    }

    #[test]
    fn evicted_fact_can_be_added_again() {
        let mut window = ContextWindow::new(ContextLimits {
            max_facts: 2,
            ..ContextLimits::default()
        });
        window.add_relevant_fact("a");
        window.add_relevant_fact("b");
        window.add_relevant_fact("c");
        assert!(window.add_relevant_fact("a"));
        let facts: Vec<_> = window.relevant_facts().collect();
        assert_eq!(facts, vec!["c", "a"]);
    }

    #[test]
    fn facts_stay_unique_and_bounded_with_duplicates_mixed_in() {
        let mut window = ContextWindow::new(ContextLimits {
            max_facts: 3,
            ..ContextLimits::default()
        });
        for fact in ["a", "b", "a", "c", "b", "d", "c", "e", "a", "e", "f", "a"] {
            window.add_relevant_fact(fact);

            let facts: Vec<_> = window.relevant_facts().collect();
            assert!(facts.len() <= 3);
            let mut unique = facts.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(unique.len(), facts.len(), "duplicate in {facts:?}");
        }

        // "a" was evicted by "d", re-added after "e"; the final "a" is a no-op
        let facts: Vec<_> = window.relevant_facts().collect();
        assert_eq!(facts, vec!["e", "a", "f"]);
    }

    #[test]
    fn preferences_last_write_wins() {
        let mut window = ContextWindow::default();
        window.set_user_preference("chain", serde_json::json!("ethereum"));
        window.set_user_preference("chain", serde_json::json!("cardano"));
        assert_eq!(
            window.user_preference("chain"),
            Some(&serde_json::json!("cardano"))
        );
    }

    #[test]
    fn init_context_retains_preferences_by_default() {
        let mut window = ContextWindow::default();
        window.add_message(numbered(1));
        window.add_relevant_fact("fact");
        window.set_user_preference("theme", serde_json::json!("dark"));

        window.init_context("session-a");

        assert!(window.is_empty());
        assert_eq!(window.relevant_facts().count(), 0);
        assert_eq!(window.session_id(), Some("session-a"));
        assert!(window.user_preference("theme").is_some());
    }

    #[test]
    fn init_context_can_reset_preferences() {
        let mut window = ContextWindow::new(ContextLimits {
            preferences: PreferenceRetention::Reset,
            ..ContextLimits::default()
        });
        window.set_user_preference("theme", serde_json::json!("dark"));

        window.init_context("session-b");

        assert!(window.preferences().is_empty());
    }
}
