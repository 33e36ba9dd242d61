//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sonicline::agent::{AgentBackend, AgentReply};
use sonicline::transport::{Connector, Envelope, Link, ReconnectPolicy};
use sonicline::{ActionHandler, ActionOutcome, Error, PromisedAction, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Remote end of an in-memory link
struct RemoteEnd {
    to_device: Option<mpsc::UnboundedSender<String>>,
    from_device: mpsc::UnboundedReceiver<String>,
}

/// In-memory [`Connector`] that records every open attempt
#[derive(Default)]
pub struct MemoryConnector {
    opens: Mutex<Vec<(Instant, String)>>,
    links: Mutex<Vec<RemoteEnd>>,
    failing: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent opens fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make subsequent opens take `delay` before resolving
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    /// Instants of every open attempt, successful or not
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    /// Sessions requested by every open attempt
    pub fn opened_sessions(&self) -> Vec<String> {
        self.opens.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Simulate the remote side closing link `index`
    pub fn sever(&self, index: usize) {
        self.links.lock().unwrap()[index].to_device = None;
    }

    /// Deliver a raw frame to the device over link `index`
    pub fn inject(&self, index: usize, frame: &str) {
        let links = self.links.lock().unwrap();
        let tx = links[index].to_device.as_ref().expect("link severed");
        tx.send(frame.to_string()).expect("device side closed");
    }

    /// Frames the device has written to link `index` so far, decoded
    pub fn sent(&self, index: usize) -> Vec<Value> {
        let mut links = self.links.lock().unwrap();
        let mut frames = Vec::new();
        while let Ok(frame) = links[index].from_device.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("device sent invalid JSON"));
        }
        frames
    }

    /// `true` once the device has dropped its side of link `index`
    pub fn device_closed(&self, index: usize) -> bool {
        let mut links = self.links.lock().unwrap();
        matches!(
            links[index].from_device.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, session_id: &str, _device_id: &str) -> Result<Link> {
        self.opens
            .lock()
            .unwrap()
            .push((Instant::now(), session_id.to_string()));

        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (to_device, inbound) = mpsc::unbounded_channel();
        let (outbound, from_device) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(RemoteEnd {
            to_device: Some(to_device),
            from_device,
        });

        Ok(Link { outbound, inbound })
    }
}

/// Policy with the default backoff shape
pub fn test_policy() -> ReconnectPolicy {
    ReconnectPolicy::default()
}

/// Frames of a given type from a list of decoded frames
pub fn of_type<'a>(frames: &'a [Value], event_type: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == event_type).collect()
}

/// Build an inbound frame as another device would send it
pub fn remote_frame(event_type: &str, payload: &Value) -> String {
    serde_json::json!({ "type": event_type, "payload": payload }).to_string()
}

/// Parse a frame, panicking on bad input
pub fn envelope(frame: &str) -> Envelope {
    Envelope::parse(frame).expect("valid envelope")
}

/// Action handler that counts calls and can be told to fail
#[derive(Default)]
pub struct CountingHandler {
    calls: AtomicUsize,
    fail: AtomicBool,
    seen: Mutex<Vec<PromisedAction>>,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let handler = Self::default();
        handler.fail.store(true, Ordering::SeqCst);
        Arc::new(handler)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<PromisedAction> {
        self.seen.lock().unwrap().clone()
    }
}

/// Registers the shared handler in an [`sonicline::ActionRegistry`]
pub struct Shared(pub Arc<CountingHandler>);

#[async_trait]
impl ActionHandler for Shared {
    async fn execute(&self, action: &PromisedAction) -> Result<ActionOutcome> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0.seen.lock().unwrap().push(action.clone());

        if self.0.fail.load(Ordering::SeqCst) {
            return Err(Error::Action("backend unavailable".to_string()));
        }
        Ok(ActionOutcome::new(format!("{} done", action.kind)))
    }
}

/// Agent backend that replays scripted replies
#[derive(Default)]
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<Result<AgentReply>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Result<AgentReply>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedAgent {
    async fn chat(&self, message: &str) -> Result<AgentReply> {
        self.prompts.lock().unwrap().push(message.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Agent("no scripted reply".to_string())))
    }
}
