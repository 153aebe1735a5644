use std::{fmt, sync::OnceLock};

use regex::Regex;

use crate::{domain::RemoteChatId, errors::RelayError};

/// Suffix WhatsApp Web uses for one-to-one chats.
pub const DIRECT_CHAT_SUFFIX: &str = "@c.us";

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?([0-9]{10,15})$").expect("valid regex"))
}

/// A phone number the operator asked to message: optional `+`, 10 to 15 ASCII digits.
///
/// Displays as the operator typed it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    raw: String,
    digits: String,
}

impl RemoteAddress {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let raw = raw.trim();
        let caps = address_re()
            .captures(raw)
            .ok_or_else(|| RelayError::InvalidTarget(raw.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            digits: caps[1].to_string(),
        })
    }

    /// The number without a leading `+`.
    pub fn digits(&self) -> &str {
        &self.digits
    }

    pub fn chat_id(&self) -> RemoteChatId {
        RemoteChatId(format!("{}{DIRECT_CHAT_SUFFIX}", self.digits))
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
