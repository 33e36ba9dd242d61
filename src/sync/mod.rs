//! History polling
//!
//! Push delivery can drop events while a device is reconnecting. Devices
//! therefore also re-fetch the hub's message history on a timer and merge it
//! through the reconciler's dedup guard.

mod poller;

pub use poller::{History, HistoryPoller, http_base};
