//! Device-to-session transport
//!
//! Each device keeps exactly one [`SyncChannel`] open to the shared session.
//! The channel frames events in the [`Envelope`] wire shape, fans inbound
//! events out to registered listeners, and recovers from unexpected closes
//! with bounded geometric backoff.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                  │ unexpected close
//!       │◀──────── error ────────┘                  ▼
//!       │◀──── attempts exhausted ─────────── Reconnecting ──timer──▶ Connecting
//! ```

mod channel;
mod connector;
mod event;

pub use channel::{ConnectionState, ListenerId, ReconnectPolicy, SyncChannel, generate_device_id};
pub use connector::{Connector, Link, WebSocketConnector};
pub use event::{Envelope, EventType, to_payload};
