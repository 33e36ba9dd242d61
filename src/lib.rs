//! SonicLine - multi-device session sync for a conversational assistant
//!
//! This library keeps several devices attached to one conversation and
//! decides, exactly once, when the assistant's words amount to a promise
//! that should be carried out:
//! - A reconnecting transport channel per device ([`transport`])
//! - Bounded conversational memory ([`context`])
//! - Heuristic promise detection and arbitration ([`intent`], [`arbitration`])
//! - Push/poll reconciliation across devices ([`reconcile`], [`sync`])
//! - Action execution against the assistant backend ([`actions`], [`agent`])
//! - The relay hub devices connect to ([`hub`])
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Device (DeviceSession)              │
//! │  Context  │  Detectors → Arbitrator  │  Reconciler   │
//! └───────┬──────────────────┬─────────────────┬─────────┘
//!         │ SyncChannel      │ ActionRegistry  │ HistoryPoller
//! ┌───────▼──────────┐ ┌─────▼──────────┐ ┌────▼─────────┐
//! │   Relay hub      │ │ Agent backend  │ │  Relay hub   │
//! │  /ws/{session}   │ │ /agent/*, /api │ │ /sessions/*  │
//! └──────────────────┘ └────────────────┘ └──────────────┘
//! ```

pub mod actions;
pub mod agent;
pub mod arbitration;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod intent;
pub mod reconcile;
pub mod session;
pub mod sync;
pub mod transport;

pub use actions::{ActionHandler, ActionOutcome, ActionRegistry, BackendClient};
pub use agent::{AgentBackend, AgentReply, CallBridge, HttpAgentBackend};
pub use arbitration::{CandidateSet, PromiseArbitrator};
pub use config::Config;
pub use context::{ActionUsage, ChatMessage, ContextWindow};
pub use error::{Error, Result};
pub use hub::{HubServer, HubState};
pub use intent::{ActionKind, DetectorRegistry, IntentDetector, PromisedAction};
pub use reconcile::SessionReconciler;
pub use session::{DeviceSession, SessionOptions, SessionUpdate, SweepOutcome};
pub use sync::{History, HistoryPoller};
pub use transport::{
    ConnectionState, Connector, Envelope, EventType, SyncChannel, WebSocketConnector,
};
