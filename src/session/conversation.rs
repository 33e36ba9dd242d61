//! Context window and arbitrator for one session, kept in lockstep

use std::collections::VecDeque;

use crate::arbitration::PromiseArbitrator;
use crate::context::{ActionUsage, ChatMessage, ContextWindow};
use crate::intent::PromisedAction;

/// Conversation state owned by a device session
#[derive(Debug, Clone)]
pub struct Conversation {
    pub context: ContextWindow,
    pub arbitrator: PromiseArbitrator,
    feed: VecDeque<ActionUsage>,
    feed_capacity: usize,
}

impl Conversation {
    #[must_use]
    pub fn new(context: ContextWindow, arbitrator: PromiseArbitrator, feed_capacity: usize) -> Self {
        Self {
            context,
            arbitrator,
            feed: VecDeque::with_capacity(feed_capacity),
            feed_capacity,
        }
    }

    /// Reset for a (re)opened session
    pub fn init(&mut self, session_id: &str) {
        self.context.init_context(session_id);
        self.arbitrator.reset();
        self.feed.clear();
    }

    /// Record a message; assistant messages run intent detection.
    ///
    /// Detections are attributed to the message's post-eviction index.
    /// Returns the number of detections merged.
    pub fn add_message(&mut self, message: ChatMessage) -> usize {
        self.add_reply(message, None)
    }

    /// [`add_message`](Self::add_message), then propose `declared` against
    /// the same index the message landed at.
    ///
    /// A declared action counts as one merged detection.
    pub fn add_reply(&mut self, message: ChatMessage, declared: Option<PromisedAction>) -> usize {
        let assistant_text = (!message.is_user).then(|| message.text.clone());
        let index = self.context.add_message(message);

        let mut merged = assistant_text.map_or(0, |text| self.arbitrator.observe(&text, index));
        if let Some(action) = declared {
            self.arbitrator.propose(action.detected_at(index));
            merged += 1;
        }
        merged
    }

    /// Record a message without running detection.
    ///
    /// Used for action results and for messages this device did not
    /// author: assistant replies relayed or polled from another device, and
    /// the backend's turn log. A promise in a remote or logged message is left to the device that received the
    /// reply, so it executes exactly once across the session rather than
    /// once per device.
    pub fn record(&mut self, message: ChatMessage) {
        self.context.add_message(message);
    }

    /// Record earlier turns the context has not seen yet, without
    /// detection. A turn already in the window (same author and text) is
    /// skipped. Returns how many were added.
    pub fn seed(&mut self, turns: impl IntoIterator<Item = ChatMessage>) -> usize {
        let mut added = 0;
        for turn in turns {
            let known = self
                .context
                .messages()
                .any(|m| m.is_user == turn.is_user && m.text == turn.text);
            if !known {
                self.record(turn);
                added += 1;
            }
        }
        added
    }

    /// Append to the "what just happened" feed
    pub fn push_action(&mut self, usage: ActionUsage) {
        self.feed.push_back(usage);
        while self.feed.len() > self.feed_capacity {
            self.feed.pop_front();
        }
    }

    /// Recent actions, oldest first
    pub fn recent_actions(&self) -> impl Iterator<Item = &ActionUsage> {
        self.feed.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::{DEFAULT_CAPACITY, DEFAULT_THRESHOLD};
    use crate::context::ContextLimits;
    use crate::intent::{ActionKind, DetectorRegistry, Parameters, TierPolicy};

    fn conversation() -> Conversation {
        Conversation::new(
            ContextWindow::new(ContextLimits::default()),
            PromiseArbitrator::new(
                DetectorRegistry::with_defaults(TierPolicy::default()),
                DEFAULT_CAPACITY,
                DEFAULT_THRESHOLD,
            ),
            3,
        )
    }

    #[test]
    fn assistant_message_triggers_detection() {
        let mut conv = conversation();
        conv.add_message(ChatMessage::user("can you make me a wallet?"));
        let merged = conv.add_message(ChatMessage::assistant(
            "I'll create a wallet for you right now",
        ));

        assert_eq!(merged, 1);
        let top = conv.arbitrator.candidates().top().unwrap();
        assert_eq!(top.kind, ActionKind::CreateWallet);
        assert_eq!(top.detected_in.unwrap().message_index, 1);
    }

    #[test]
    fn user_message_never_triggers_detection() {
        let mut conv = conversation();
        let merged = conv.add_message(ChatMessage::user("I'll create a wallet for you right now"));
        assert_eq!(merged, 0);
        assert!(conv.arbitrator.candidates().is_empty());
    }

    #[test]
    fn detection_index_is_post_eviction() {
        let mut conv = conversation();
        for n in 0..25 {
            conv.add_message(ChatMessage::user(format!("filler {n}")));
        }
        conv.add_message(ChatMessage::assistant("I'll create a wallet for you"));

        let top = conv.arbitrator.candidates().top().unwrap();
        assert_eq!(top.detected_in.unwrap().message_index, 19);
    }

    #[test]
    fn record_skips_detection() {
        let mut conv = conversation();
        conv.record(ChatMessage::assistant("I'll create a wallet for you right now"));
        assert_eq!(conv.context.len(), 1);
        assert!(conv.arbitrator.candidates().is_empty());
    }

    #[test]
    fn declared_action_shares_the_reply_index() {
        let mut conv = conversation();
        for n in 0..25 {
            conv.add_message(ChatMessage::user(format!("filler {n}")));
        }
        let declared = PromisedAction::new(ActionKind::MintNft, 1.0, Parameters::new());
        let merged = conv.add_reply(ChatMessage::assistant("Sure thing."), Some(declared));

        assert_eq!(merged, 1);
        let top = conv.arbitrator.candidates().top().unwrap();
        assert_eq!(top.kind, ActionKind::MintNft);
        assert_eq!(top.detected_in.unwrap().message_index, 19);
        assert_eq!(conv.context.message(19).unwrap().text, "Sure thing.");
    }

    #[test]
    fn seed_skips_known_turns_and_detection() {
        let mut conv = conversation();
        conv.add_message(ChatMessage::user("hello"));

        let added = conv.seed([
            ChatMessage::user("hello"),
            ChatMessage::assistant("I'll create a wallet for you right now"),
            ChatMessage::user("thanks"),
        ]);

        assert_eq!(added, 2);
        assert_eq!(conv.context.len(), 3);
        assert!(conv.arbitrator.candidates().is_empty());
    }

    #[test]
    fn feed_is_bounded() {
        let mut conv = conversation();
        for n in 0..5 {
            conv.push_action(ActionUsage::new("mint-nft", format!("minted {n}")));
        }
        let feed: Vec<_> = conv.recent_actions().map(|a| a.description.clone()).collect();
        assert_eq!(feed, vec!["minted 2", "minted 3", "minted 4"]);
    }

    #[test]
    fn init_clears_pending_candidates() {
        let mut conv = conversation();
        conv.add_message(ChatMessage::assistant("I'll create a wallet for you"));
        conv.init("fresh");
        assert!(conv.arbitrator.candidates().is_empty());
        assert!(conv.context.is_empty());
    }
}
