//! Core domain + application logic for the WhatsApp ⇄ Telegram relay.
//!
//! This crate is intentionally framework-agnostic. Telegram and the WhatsApp Web
//! sidecar live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod media;
pub mod messaging;
pub mod relay;
pub mod remote;
pub mod security;

pub use errors::{Error, RelayError, Result};
