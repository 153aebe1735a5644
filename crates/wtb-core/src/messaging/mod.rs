//! Relay-side (Telegram) abstractions.

pub mod port;
pub mod throttled;
pub mod types;
