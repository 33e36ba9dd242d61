//! Conversational memory
//!
//! - [`ChatMessage`]: one immutable conversational turn
//! - [`ContextWindow`]: bounded history, facts and preferences for a session

mod message;
mod window;

pub use message::{ActionUsage, ChatMessage};
pub use window::{
    ContextLimits, ContextWindow, DEFAULT_MAX_FACTS, DEFAULT_MAX_MESSAGES, PreferenceRetention,
};
