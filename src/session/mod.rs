//! Per-device composition of the sync engine
//!
//! ```text
//!   user input ──▶ submit_user_message ──▶ context ──▶ transport (new_message)
//!   agent reply ─▶ record_assistant_message ──▶ context ──▶ detectors ──▶ candidates
//!   sweeper ─────▶ select_for_execution ──▶ actions ──▶ result message + action_used
//!   transport ───▶ reconciler (push) ──▶ context / action feed
//!   poller ──────▶ reconciler (poll) ──▶ context / action feed
//! ```
//!
//! Only messages authored on this device run intent detection. Messages
//! replayed from other devices, and turns from the agent's own log, are
//! recorded without detection so a promise is executed by the device that
//! heard it and nowhere else.

mod conversation;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::Result;
use crate::actions::ActionRegistry;
use crate::agent::{AgentBackend, AgentReply, TurnLog};
use crate::arbitration::{DEFAULT_CAPACITY, DEFAULT_THRESHOLD, PromiseArbitrator};
use crate::context::{ActionUsage, ChatMessage, ContextLimits, ContextWindow};
use crate::intent::{DetectorRegistry, PromisedAction, TierPolicy};
use crate::reconcile::{DEFAULT_KEY_CAPACITY, RemoteItem, SessionReconciler, Verdict};
use crate::transport::{Envelope, EventType, ListenerId, SyncChannel, to_payload};

pub use conversation::Conversation;

/// Default size of the recent action feed
pub const DEFAULT_FEED_CAPACITY: usize = 50;

/// Default period between candidate sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

const UPDATE_BUFFER: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tuning for a [`DeviceSession`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    pub context: ContextLimits,
    pub candidate_capacity: usize,
    pub threshold: f64,
    pub tier_policy: TierPolicy,
    pub feed_capacity: usize,
    pub dedup_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            context: ContextLimits::default(),
            candidate_capacity: DEFAULT_CAPACITY,
            threshold: DEFAULT_THRESHOLD,
            tier_policy: TierPolicy::default(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            dedup_capacity: DEFAULT_KEY_CAPACITY,
        }
    }
}

/// Something became visible in this device's conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Message(ChatMessage),
    Action(ActionUsage),
}

/// Result of one sweep
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Nothing cleared the threshold (or a dispatch is already running)
    Idle,
    /// The action ran and its result was posted
    Executed(PromisedAction),
    /// The action failed; an error-flagged message was posted
    Failed { action: PromisedAction, error: String },
}

/// How a locally authored message enters the conversation
enum Entry {
    /// Run detection on assistant text and propose the declared action,
    /// if any, at the same index
    Detected(Option<PromisedAction>),
    /// Record as-is
    Plain,
}

/// One device's view of a shared session
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    channel: SyncChannel,
    conversation: Mutex<Conversation>,
    reconciler: Mutex<SessionReconciler>,
    actions: ActionRegistry,
    listeners: Mutex<Vec<(EventType, ListenerId)>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("channel", &self.inner.channel)
            .field("actions", &self.inner.actions)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Build a session around a channel, with the default detectors
    #[must_use]
    pub fn new(channel: SyncChannel, actions: ActionRegistry, options: SessionOptions) -> Self {
        let detectors = DetectorRegistry::with_defaults(options.tier_policy);
        Self::with_detectors(channel, actions, detectors, options)
    }

    /// Build a session with a custom detector set
    #[must_use]
    pub fn with_detectors(
        channel: SyncChannel,
        actions: ActionRegistry,
        detectors: DetectorRegistry,
        options: SessionOptions,
    ) -> Self {
        let conversation = Conversation::new(
            ContextWindow::new(options.context),
            PromiseArbitrator::new(detectors, options.candidate_capacity, options.threshold),
            options.feed_capacity,
        );
        let reconciler = SessionReconciler::new(channel.device_id(), options.dedup_capacity);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let inner = Arc::new(SessionInner {
            channel,
            conversation: Mutex::new(conversation),
            reconciler: Mutex::new(reconciler),
            actions,
            listeners: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
            updates,
        });

        let mut ids = Vec::new();
        for event_type in [EventType::NewMessage, EventType::ActionUsed] {
            let weak: Weak<SessionInner> = Arc::downgrade(&inner);
            let id = inner.channel.on(event_type, move |envelope| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_remote(envelope);
                }
            });
            ids.push((event_type, id));
        }
        *lock(&inner.listeners) = ids;

        Self { inner }
    }

    #[must_use]
    pub fn channel(&self) -> &SyncChannel {
        &self.inner.channel
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        self.inner.channel.device_id()
    }

    /// Open (or reopen) a session: reset local state, then connect
    pub async fn open(&self, session_id: &str) -> bool {
        lock(&self.inner.conversation).init(session_id);
        lock(&self.inner.reconciler).reset();

        tracing::info!(session_id, device_id = %self.device_id(), "opening session");
        self.inner.channel.connect(session_id).await
    }

    /// Record and share a message typed (or spoken) on this device
    pub fn submit_user_message(&self, text: &str) -> ChatMessage {
        let (message, _) = self.inner.publish_local(ChatMessage::user(text), Entry::Detected(None));
        message
    }

    /// Record and share an assistant reply received on this device.
    ///
    /// Runs intent detection; returns the number of detections merged.
    pub fn record_assistant_message(&self, text: &str) -> usize {
        let (_, merged) = self
            .inner
            .publish_local(ChatMessage::assistant(text), Entry::Detected(None));
        merged
    }

    /// Apply a full agent reply.
    ///
    /// Turns from the backend's log that the context has not seen are
    /// recorded first, without detection. The reply text then goes through
    /// detection and a declared action is proposed at full confidence.
    /// Returns the number of candidates merged.
    pub fn apply_agent_reply(&self, reply: &AgentReply) -> usize {
        let turns = reply.logs.iter().map(TurnLog::to_message);
        let seeded = lock(&self.inner.conversation).seed(turns);
        if seeded > 0 {
            tracing::debug!(seeded, "context seeded from agent turn log");
        }

        let declared = reply.action.as_ref().and_then(|declared| {
            let action = declared.to_promised();
            if action.is_none() {
                tracing::debug!(
                    action = %declared.name,
                    "ignoring backend action with no local handler kind"
                );
            }
            action
        });

        let (_, merged) = self.inner.publish_local(
            ChatMessage::assistant(reply.response.clone()),
            Entry::Detected(declared),
        );
        merged
    }

    /// One full turn: share the user text, ask the agent, apply its reply.
    ///
    /// # Errors
    ///
    /// Returns the backend error after posting an error-flagged message
    pub async fn converse(&self, backend: &dyn AgentBackend, text: &str) -> Result<usize> {
        self.submit_user_message(text);

        match backend.chat(text).await {
            Ok(reply) => Ok(self.apply_agent_reply(&reply)),
            Err(e) => {
                tracing::warn!(error = %e, "agent backend failed");
                self.inner.publish_local(
                    ChatMessage::error("Sorry, I couldn't reach the assistant. Please try again."),
                    Entry::Plain,
                );
                Err(e)
            }
        }
    }

    /// Execute the best pending promise if it clears the threshold.
    ///
    /// The candidate set is cleared on selection; a failed dispatch is
    /// reported in the conversation and never retried.
    pub async fn sweep_once(&self) -> SweepOutcome {
        let Some(action) = lock(&self.inner.conversation).arbitrator.select_for_execution() else {
            return SweepOutcome::Idle;
        };

        let result = self.inner.actions.dispatch(&action).await;
        lock(&self.inner.conversation).arbitrator.finish_dispatch();

        match result {
            Ok(outcome) => {
                tracing::info!(kind = %action.kind, "promised action executed");

                let mut message = ChatMessage::assistant(outcome.summary.clone());
                if let Some(url) = outcome.image_url {
                    message = message.with_image(url);
                }
                self.inner.publish_local(message, Entry::Plain);
                self.inner
                    .publish_action(ActionUsage::new(action.kind.as_str(), outcome.summary));

                SweepOutcome::Executed(action)
            }
            Err(e) => {
                tracing::warn!(kind = %action.kind, error = %e, "promised action failed");
                self.inner.publish_local(
                    ChatMessage::error(format!("Sorry, I couldn't complete {}: {e}", action.kind)),
                    Entry::Plain,
                );
                SweepOutcome::Failed {
                    action,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Run [`sweep_once`](Self::sweep_once) periodically until the session
    /// is closed or dropped. Replaces any running sweeper.
    pub fn spawn_sweeper(&self, period: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let outcome = Self { inner }.sweep_once().await;
                if outcome != SweepOutcome::Idle {
                    tracing::debug!(?outcome, "sweep");
                }
            }
        });

        if let Some(previous) = lock(&self.inner.sweeper).replace(handle) {
            previous.abort();
        }
    }

    /// Merge a polled history snapshot. Returns the number of new messages.
    pub fn apply_polled(&self, history: Vec<ChatMessage>) -> usize {
        let fresh = lock(&self.inner.reconciler).accept_polled(history);
        let count = fresh.len();

        for message in fresh {
            lock(&self.inner.conversation).record(message.clone());
            let _ = self.inner.updates.send(SessionUpdate::Message(message));
        }

        if count > 0 {
            tracing::debug!(count, "applied polled messages");
        }
        count
    }

    /// Merge polled action records into the feed. Returns the number of
    /// new records.
    pub fn apply_polled_actions(&self, actions: Vec<ActionUsage>) -> usize {
        let fresh = lock(&self.inner.reconciler).accept_polled_actions(actions);
        let count = fresh.len();

        for usage in fresh {
            lock(&self.inner.conversation).push_action(usage.clone());
            let _ = self.inner.updates.send(SessionUpdate::Action(usage));
        }

        if count > 0 {
            tracing::debug!(count, "applied polled actions");
        }
        count
    }

    /// Stop sweeping and leave the session
    pub fn close(&self) {
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        self.inner.channel.disconnect();
    }

    /// Receive conversation updates as they become visible
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }

    /// Current context window contents, oldest first
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.inner.conversation).context.messages().cloned().collect()
    }

    /// Recent action feed, oldest first
    #[must_use]
    pub fn recent_actions(&self) -> Vec<ActionUsage> {
        lock(&self.inner.conversation).recent_actions().cloned().collect()
    }

    /// Pending candidates, best first
    #[must_use]
    pub fn candidates(&self) -> Vec<PromisedAction> {
        lock(&self.inner.conversation)
            .arbitrator
            .candidates()
            .iter()
            .cloned()
            .collect()
    }

    /// Add a derived fact to the context window
    pub fn add_relevant_fact(&self, fact: &str) -> bool {
        lock(&self.inner.conversation).context.add_relevant_fact(fact)
    }

    /// Set a user preference on the context window
    pub fn set_user_preference(&self, key: &str, value: serde_json::Value) {
        lock(&self.inner.conversation)
            .context
            .set_user_preference(key, value);
    }
}

impl SessionInner {
    fn session_id(&self) -> String {
        lock(&self.conversation)
            .context
            .session_id()
            .map(str::to_string)
            .or_else(|| self.channel.session_id())
            .unwrap_or_default()
    }

    /// Record a locally authored message, then share it.
    ///
    /// Returns the stamped message and the number of candidates merged
    /// (only assistant messages entered as [`Entry::Detected`] merge any).
    fn publish_local(&self, message: ChatMessage, entry: Entry) -> (ChatMessage, usize) {
        let message = message.with_origin(self.channel.device_id(), &self.session_id());

        lock(&self.reconciler).record_local_message(&message);
        let merged = {
            let mut conversation = lock(&self.conversation);
            match entry {
                Entry::Detected(declared) => conversation.add_reply(message.clone(), declared),
                Entry::Plain => {
                    conversation.record(message.clone());
                    0
                }
            }
        };

        self.send(EventType::NewMessage, &message);
        let _ = self.updates.send(SessionUpdate::Message(message.clone()));
        (message, merged)
    }

    fn publish_action(&self, usage: ActionUsage) {
        let usage = usage.with_origin(self.channel.device_id(), &self.session_id());

        lock(&self.reconciler).record_local_action(&usage);
        lock(&self.conversation).push_action(usage.clone());

        self.send(EventType::ActionUsed, &usage);
        let _ = self.updates.send(SessionUpdate::Action(usage));
    }

    fn send<T: Serialize>(&self, event_type: EventType, value: &T) {
        match to_payload(value) {
            Ok(payload) => {
                if !self.channel.send_event(event_type, payload) {
                    tracing::debug!(%event_type, "event not shared; channel offline");
                }
            }
            Err(e) => tracing::warn!(%event_type, error = %e, "failed to encode event"),
        }
    }

    fn apply_remote(&self, envelope: &Envelope) {
        let verdict = lock(&self.reconciler).accept_push(envelope);

        match verdict {
            Verdict::Apply(RemoteItem::Message(message)) => {
                lock(&self.conversation).record(message.clone());
                let _ = self.updates.send(SessionUpdate::Message(message));
            }
            Verdict::Apply(RemoteItem::Action(usage)) => {
                lock(&self.conversation).push_action(usage.clone());
                let _ = self.updates.send(SessionUpdate::Action(usage));
            }
            Verdict::SelfSourced | Verdict::Duplicate | Verdict::Ignored | Verdict::Malformed => {}
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
        for (event_type, id) in lock(&self.listeners).drain(..) {
            self.channel.off(event_type, id);
        }
    }
}
