//! Multi-device event reconciliation
//!
//! A device sees conversation items through two independent streams: pushed
//! events from the transport and full-history re-fetches from the polling
//! path. Both streams are merged through the same two guards:
//!
//! 1. items stamped with the local device id were already applied at
//!    dispatch time and are never re-applied;
//! 2. items whose dedup key (author + text + timestamp) is already displayed
//!    are dropped.
//!
//! Push and poll can race, so neither guard alone is sufficient.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::context::{ActionUsage, ChatMessage};
use crate::transport::{Envelope, EventType};

/// Default number of remembered dedup keys
pub const DEFAULT_KEY_CAPACITY: usize = 1000;

/// Idempotent identity of a displayed item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Message {
        is_user: bool,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Action {
        name: String,
        description: String,
        timestamp: DateTime<Utc>,
    },
}

impl DedupKey {
    #[must_use]
    pub fn for_message(message: &ChatMessage) -> Self {
        Self::Message {
            is_user: message.is_user,
            text: message.text.clone(),
            timestamp: message.timestamp,
        }
    }

    #[must_use]
    pub fn for_action(action: &ActionUsage) -> Self {
        Self::Action {
            name: action.name.clone(),
            description: action.description.clone(),
            timestamp: action.timestamp,
        }
    }
}

/// A conversation item received from another device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteItem {
    Message(ChatMessage),
    Action(ActionUsage),
}

/// Decision for one inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// New item; apply it to local state
    Apply(RemoteItem),
    /// Originated on this device
    SelfSourced,
    /// Already displayed
    Duplicate,
    /// Not a conversation item (presence, tool usage, ...)
    Ignored,
    /// Payload did not decode
    Malformed,
}

/// Per-device reconciler
#[derive(Debug)]
pub struct SessionReconciler {
    local_device_id: String,
    displayed: LruCache<DedupKey, ()>,
}

impl SessionReconciler {
    #[must_use]
    pub fn new(local_device_id: &str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_device_id: local_device_id.to_string(),
            displayed: LruCache::new(capacity),
        }
    }

    /// Mark a locally originated message as displayed
    pub fn record_local_message(&mut self, message: &ChatMessage) {
        self.displayed.put(DedupKey::for_message(message), ());
    }

    /// Mark a locally originated action as displayed
    pub fn record_local_action(&mut self, action: &ActionUsage) {
        self.displayed.put(DedupKey::for_action(action), ());
    }

    /// Forget everything displayed (session reopened)
    pub fn reset(&mut self) {
        self.displayed.clear();
    }

    /// Decide whether a pushed event should be applied
    pub fn accept_push(&mut self, envelope: &Envelope) -> Verdict {
        let item = match envelope.event_type {
            EventType::NewMessage => envelope.decode::<ChatMessage>().map(RemoteItem::Message),
            EventType::ActionUsed => envelope.decode::<ActionUsage>().map(RemoteItem::Action),
            _ => return Verdict::Ignored,
        };

        match item {
            Ok(item) => self.admit(envelope.device_id(), item),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable event");
                Verdict::Malformed
            }
        }
    }

    /// Filter a polled history snapshot down to messages not yet displayed
    pub fn accept_polled(&mut self, history: impl IntoIterator<Item = ChatMessage>) -> Vec<ChatMessage> {
        history
            .into_iter()
            .filter_map(|message| {
                let origin = message.device_id.clone();
                match self.admit(origin.as_deref(), RemoteItem::Message(message)) {
                    Verdict::Apply(RemoteItem::Message(m)) => Some(m),
                    _ => None,
                }
            })
            .collect()
    }

    /// Filter polled action records down to those not yet in the feed
    pub fn accept_polled_actions(
        &mut self,
        actions: impl IntoIterator<Item = ActionUsage>,
    ) -> Vec<ActionUsage> {
        actions
            .into_iter()
            .filter_map(|usage| {
                let origin = usage.device_id.clone();
                match self.admit(origin.as_deref(), RemoteItem::Action(usage)) {
                    Verdict::Apply(RemoteItem::Action(a)) => Some(a),
                    _ => None,
                }
            })
            .collect()
    }

    fn admit(&mut self, origin: Option<&str>, item: RemoteItem) -> Verdict {
        if origin == Some(self.local_device_id.as_str()) {
            return Verdict::SelfSourced;
        }

        let key = match &item {
            RemoteItem::Message(m) => DedupKey::for_message(m),
            RemoteItem::Action(a) => DedupKey::for_action(a),
        };
        if self.displayed.contains(&key) {
            tracing::trace!(?key, "duplicate item dropped");
            return Verdict::Duplicate;
        }

        self.displayed.put(key, ());
        Verdict::Apply(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::to_payload;

    fn message_event(message: &ChatMessage, device_id: &str) -> Envelope {
        let mut env = Envelope::new(EventType::NewMessage, to_payload(message).unwrap());
        env.stamp(device_id, "session");
        env
    }

    #[test]
    fn self_sourced_push_is_never_applied() {
        let mut rec = SessionReconciler::new("local", 10);
        let msg = ChatMessage::user("hello");

        assert_eq!(rec.accept_push(&message_event(&msg, "local")), Verdict::SelfSourced);
    }

    #[test]
    fn remote_push_applied_once() {
        let mut rec = SessionReconciler::new("local", 10);
        let msg = ChatMessage::assistant("hi there");
        let event = message_event(&msg, "remote");

        assert!(matches!(rec.accept_push(&event), Verdict::Apply(RemoteItem::Message(_))));
        assert_eq!(rec.accept_push(&event), Verdict::Duplicate);
    }

    #[test]
    fn push_then_poll_applies_once() {
        let mut rec = SessionReconciler::new("local", 10);
        let msg = ChatMessage::assistant("hi there").with_origin("remote", "session");

        assert!(matches!(rec.accept_push(&message_event(&msg, "remote")), Verdict::Apply(_)));
        assert!(rec.accept_polled(vec![msg]).is_empty());
    }

    #[test]
    fn poll_then_push_applies_once() {
        let mut rec = SessionReconciler::new("local", 10);
        let msg = ChatMessage::assistant("hi there").with_origin("remote", "session");

        assert_eq!(rec.accept_polled(vec![msg.clone()]).len(), 1);
        assert_eq!(rec.accept_push(&message_event(&msg, "remote")), Verdict::Duplicate);
    }

    #[test]
    fn poll_skips_locally_recorded_messages() {
        let mut rec = SessionReconciler::new("local", 10);
        let mine = ChatMessage::user("typed here");
        rec.record_local_message(&mine);

        // Polled copy lost its provenance tag; the key guard still catches it
        assert!(rec.accept_polled(vec![mine]).is_empty());
    }

    #[test]
    fn poll_skips_self_sourced_even_when_key_forgotten() {
        let mut rec = SessionReconciler::new("local", 10);
        let mine = ChatMessage::user("typed here").with_origin("local", "session");
        assert!(rec.accept_polled(vec![mine]).is_empty());
    }

    #[test]
    fn same_text_different_author_is_distinct() {
        let mut rec = SessionReconciler::new("local", 10);
        let ts = Utc::now();
        let user = ChatMessage::user("ok").at(ts);
        let bot = ChatMessage::assistant("ok").at(ts);

        assert_eq!(rec.accept_polled(vec![user, bot]).len(), 2);
    }

    #[test]
    fn actions_deduplicate_by_name_description_timestamp() {
        let mut rec = SessionReconciler::new("local", 10);
        let usage = ActionUsage::new("create-wallet", "Created wallet 0xabc");
        let mut env = Envelope::new(EventType::ActionUsed, to_payload(&usage).unwrap());
        env.stamp("remote", "session");

        assert!(matches!(rec.accept_push(&env), Verdict::Apply(RemoteItem::Action(_))));
        assert_eq!(rec.accept_push(&env), Verdict::Duplicate);
    }

    #[test]
    fn local_action_is_not_reapplied() {
        let mut rec = SessionReconciler::new("local", 10);
        let usage = ActionUsage::new("mint-nft", "Minted");
        rec.record_local_action(&usage);

        let mut env = Envelope::new(EventType::ActionUsed, to_payload(&usage).unwrap());
        env.stamp("remote", "session");
        assert_eq!(rec.accept_push(&env), Verdict::Duplicate);
    }

    #[test]
    fn polled_actions_skip_pushed_and_local() {
        let mut rec = SessionReconciler::new("local", 10);
        let pushed = ActionUsage::new("mint-nft", "Minted a fox").with_origin("remote", "session");
        let mine = ActionUsage::new("create-wallet", "Created").with_origin("local", "session");
        let missed = ActionUsage::new("swap-tokens", "Swapped").with_origin("remote", "session");

        let mut env = Envelope::new(EventType::ActionUsed, to_payload(&pushed).unwrap());
        env.stamp("remote", "session");
        assert!(matches!(rec.accept_push(&env), Verdict::Apply(_)));

        let fresh = rec.accept_polled_actions(vec![pushed, mine, missed.clone()]);
        assert_eq!(fresh, vec![missed.clone()]);
        assert!(rec.accept_polled_actions(vec![missed]).is_empty());
    }

    #[test]
    fn non_conversation_events_are_ignored() {
        let mut rec = SessionReconciler::new("local", 10);
        let mut env = Envelope::new(EventType::SessionJoined, serde_json::Map::new());
        env.stamp("remote", "session");
        assert_eq!(rec.accept_push(&env), Verdict::Ignored);
    }

    #[test]
    fn malformed_payload_is_reported() {
        let mut rec = SessionReconciler::new("local", 10);
        let mut env = Envelope::new(EventType::NewMessage, serde_json::Map::new());
        env.stamp("remote", "session");
        assert_eq!(rec.accept_push(&env), Verdict::Malformed);
    }
}
