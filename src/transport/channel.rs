//! Per-device session channel with automatic reconnection

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connector::Connector;
use super::event::{Envelope, EventType};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for a scheduled retry after an unexpected close
    Reconnecting,
}

/// Backoff policy for automatic reconnection
///
/// Retry `n` (1-based) waits `base_delay × multiplier^(n−1)`. After
/// `max_attempts` failed retries the channel stays disconnected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.base_delay.mul_f64(self.multiplier.powi(exponent))
    }
}

/// Handle returned by [`SyncChannel::on`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct LinkState {
    status: ConnectionState,
    session_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    attempts: u32,
    /// Bumped on every new link, scheduled retry and manual disconnect so
    /// stale readers and timers can tell they were superseded
    generation: u64,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Inner {
    device_id: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: Mutex<LinkState>,
    listeners: Mutex<HashMap<EventType, Vec<(ListenerId, Listener)>>>,
    next_listener: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One bidirectional connection from this device to a shared session
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct SyncChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.inner.state);
        f.debug_struct("SyncChannel")
            .field("device_id", &self.inner.device_id)
            .field("status", &st.status)
            .field("session_id", &st.session_id)
            .field("attempts", &st.attempts)
            .finish_non_exhaustive()
    }
}

/// Generate a random device identifier
#[must_use]
pub fn generate_device_id() -> String {
    format!("device-{}", uuid::Uuid::new_v4().simple())
}

impl SyncChannel {
    #[must_use]
    pub fn new(device_id: &str, connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.to_string(),
                connector,
                policy,
                state: Mutex::new(LinkState {
                    status: ConnectionState::Disconnected,
                    session_id: None,
                    outbound: None,
                    attempts: 0,
                    generation: 0,
                    reader: None,
                    retry: None,
                }),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).status
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.state).session_id.clone()
    }

    /// Retries consumed since the last successful connection
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.state).attempts
    }

    /// Connect to `session_id`.
    ///
    /// Resolves `true` immediately if already connected to that session and
    /// `false` immediately if another attempt is in flight. Connecting to a
    /// different session leaves the current one first. On success a
    /// `session_joined` event is sent before returning.
    pub async fn connect(&self, session_id: &str) -> bool {
        let switching = {
            let st = lock(&self.inner.state);
            match st.status {
                ConnectionState::Connected if st.session_id.as_deref() == Some(session_id) => {
                    return true;
                }
                ConnectionState::Connecting => {
                    tracing::debug!(session_id, "connection attempt already in flight");
                    return false;
                }
                ConnectionState::Connected => true,
                ConnectionState::Disconnected | ConnectionState::Reconnecting => false,
            }
        };

        if switching {
            self.disconnect();
        }

        let generation = {
            let mut st = lock(&self.inner.state);
            if let Some(retry) = st.retry.take() {
                retry.abort();
            }
            st.status = ConnectionState::Connecting;
            st.session_id = Some(session_id.to_string());
            st.attempts = 0;
            st.generation += 1;
            st.generation
        };

        match Inner::establish(&self.inner, session_id, generation).await {
            Ok(()) => {
                tracing::info!(
                    session_id,
                    device_id = %self.inner.device_id,
                    "connected to session"
                );
                self.inner.announce_joined();
                true
            }
            Err(e) => {
                let mut st = lock(&self.inner.state);
                if st.generation == generation {
                    st.status = ConnectionState::Disconnected;
                }
                tracing::warn!(session_id, error = %e, "failed to connect to session");
                false
            }
        }
    }

    /// Stamp and transmit an event.
    ///
    /// Returns `false` without raising if not connected or if transmission
    /// fails.
    pub fn send_event(&self, event_type: EventType, payload: Map<String, Value>) -> bool {
        self.inner.send(Envelope::new(event_type, payload))
    }

    /// Register a listener for an event type
    pub fn on<F>(&self, event_type: EventType, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners)
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener. Returns `true` if it was registered.
    pub fn off(&self, event_type: EventType, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let Some(list) = listeners.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        before != list.len()
    }

    /// Leave the session.
    ///
    /// Sends `session_left` if connected, cancels any pending retry and
    /// never schedules a new one. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let (was_connected, session_id, outbound, reader) = {
            let mut st = lock(&self.inner.state);
            st.generation += 1;
            if let Some(retry) = st.retry.take() {
                retry.abort();
            }
            let was_connected = st.status == ConnectionState::Connected;
            st.status = ConnectionState::Disconnected;
            st.attempts = 0;
            (
                was_connected,
                st.session_id.take(),
                st.outbound.take(),
                st.reader.take(),
            )
        };

        if let (true, Some(session_id), Some(outbound)) = (was_connected, &session_id, &outbound) {
            let mut farewell = Envelope::new(EventType::SessionLeft, Map::new());
            farewell.stamp(&self.inner.device_id, session_id);
            if let Ok(frame) = farewell.to_frame() {
                let _ = outbound.send(frame);
            }
            tracing::info!(session_id = %session_id, "left session");
        }

        drop(outbound);
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    /// Deliver an inbound envelope to listeners as if received from the link
    pub fn dispatch(&self, envelope: &Envelope) {
        self.inner.dispatch(envelope);
    }
}

impl Inner {
    /// Open a link for `generation`; tears it down if superseded meanwhile
    async fn establish(inner: &Arc<Self>, session_id: &str, generation: u64) -> crate::Result<()> {
        let link = inner.connector.open(session_id, &inner.device_id).await;

        let mut st = lock(&inner.state);
        if st.generation != generation {
            tracing::debug!(session_id, "connection superseded, closing");
            return Err(crate::Error::Transport("connection superseded".to_string()));
        }

        let link = link?;
        st.status = ConnectionState::Connected;
        st.outbound = Some(link.outbound);
        st.attempts = 0;
        st.reader = Some(tokio::spawn(Self::read_loop(
            Arc::clone(inner),
            link.inbound,
            generation,
        )));
        Ok(())
    }

    async fn read_loop(
        inner: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<String>,
        generation: u64,
    ) {
        while let Some(frame) = inbound.recv().await {
            match Envelope::parse(&frame) {
                Ok(envelope) => inner.dispatch(&envelope),
                Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
            }
        }
        Self::handle_close(&inner, generation);
    }

    fn handle_close(inner: &Arc<Self>, generation: u64) {
        let mut st = lock(&inner.state);
        if st.generation != generation || st.status != ConnectionState::Connected {
            return;
        }
        tracing::warn!(session_id = ?st.session_id, "connection lost");
        st.outbound = None;
        st.reader = None;
        Self::schedule_retry(inner, &mut st);
    }

    fn schedule_retry(inner: &Arc<Self>, st: &mut LinkState) {
        let Some(session_id) = st.session_id.clone() else {
            st.status = ConnectionState::Disconnected;
            return;
        };

        if st.attempts >= inner.policy.max_attempts {
            tracing::warn!(
                session_id = %session_id,
                attempts = st.attempts,
                "reconnect attempts exhausted, staying disconnected"
            );
            st.status = ConnectionState::Disconnected;
            return;
        }

        st.attempts += 1;
        st.generation += 1;
        st.status = ConnectionState::Reconnecting;

        let attempt = st.attempts;
        let generation = st.generation;
        let delay = inner.policy.delay_for_attempt(attempt);
        tracing::info!(
            session_id = %session_id,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        let task_inner = Arc::clone(inner);
        st.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::retry(task_inner, session_id, generation).await;
        }));
    }

    async fn retry(inner: Arc<Self>, session_id: String, generation: u64) {
        {
            let mut st = lock(&inner.state);
            if st.generation != generation {
                return;
            }
            st.status = ConnectionState::Connecting;
            st.retry = None;
        }

        match Self::establish(&inner, &session_id, generation).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, "reconnected to session");
                inner.announce_joined();
            }
            Err(e) => {
                let mut st = lock(&inner.state);
                if st.generation == generation {
                    tracing::warn!(session_id = %session_id, error = %e, "reconnect failed");
                    Self::schedule_retry(&inner, &mut st);
                }
            }
        }
    }

    fn announce_joined(&self) {
        if !self.send(Envelope::new(EventType::SessionJoined, Map::new())) {
            tracing::debug!("could not announce session join");
        }
    }

    fn send(&self, mut envelope: Envelope) -> bool {
        let st = lock(&self.state);
        let (ConnectionState::Connected, Some(outbound), Some(session_id)) =
            (st.status, &st.outbound, &st.session_id)
        else {
            tracing::debug!(event = %envelope.event_type, "not connected, dropping event");
            return false;
        };

        envelope.stamp(&self.device_id, session_id);
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(event = %envelope.event_type, error = %e, "failed to encode event");
                return false;
            }
        };

        if outbound.send(frame).is_err() {
            tracing::warn!(event = %envelope.event_type, "link closed, event not sent");
            return false;
        }
        true
    }

    fn dispatch(&self, envelope: &Envelope) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .get(&envelope.event_type)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(envelope))).is_err() {
                tracing::error!(event = %envelope.event_type, "listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            ..ReconnectPolicy::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2250));
    }

    #[test]
    fn backoff_strictly_increases() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=policy.max_attempts)
            .map(|n| policy.delay_for_attempt(n))
            .collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn default_policy_values() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert!((policy.multiplier - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn device_ids_are_unique() {
        assert_ne!(generate_device_id(), generate_device_id());
    }
}
