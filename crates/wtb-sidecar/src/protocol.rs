//! Line protocol spoken with the bridge sidecar.
//!
//! One JSON object per line in both directions. Requests carry an `id` that the
//! sidecar echoes back in an `ack` event.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wtb_core::{
    domain::RemoteChatId,
    media::{extension_from_mime, MediaPayload, DEFAULT_MIME},
    remote::{RemoteEvent, RemoteMedia, RemoteMessage},
    Result,
};

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarEvent {
    Qr {
        code: String,
        #[serde(default)]
        image_path: Option<PathBuf>,
    },
    Ready,
    Message(MessageEvent),
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    AuthFailure {
        #[serde(default)]
        message: Option<String>,
    },
    Ack {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct MessageEvent {
    pub from: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub sender_number: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub media: Option<MediaEvent>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct MediaEvent {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl SidecarEvent {
    /// The relay-facing event, if this line is one. Acks and unknown types are not.
    pub fn into_remote(self) -> Option<RemoteEvent> {
        match self {
            SidecarEvent::Qr { code, image_path } => Some(RemoteEvent::PairingChallenge {
                token: code,
                image: image_path,
            }),
            SidecarEvent::Ready => Some(RemoteEvent::Ready),
            SidecarEvent::Message(msg) => Some(RemoteEvent::Message(msg.into_remote())),
            SidecarEvent::Disconnected { reason } => Some(RemoteEvent::Disconnected {
                reason: reason.unwrap_or_else(|| "unknown".to_string()),
            }),
            SidecarEvent::AuthFailure { message } => Some(RemoteEvent::InitFailed {
                reason: format!(
                    "authentication failure: {}",
                    message.unwrap_or_else(|| "unknown".to_string())
                ),
            }),
            SidecarEvent::Ack { .. } | SidecarEvent::Unknown => None,
        }
    }
}

impl MessageEvent {
    fn into_remote(self) -> RemoteMessage {
        let media = self.media.map(|m| {
            let mime_type = m
                .mime_type
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MIME.to_string());
            let file_name = m
                .file_name
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("media.{}", extension_from_mime(Some(&mime_type))));
            RemoteMedia {
                payload: m
                    .path
                    .map(|path| MediaPayload::new(path, mime_type, file_name)),
            }
        });

        RemoteMessage {
            from: RemoteChatId(self.from),
            sender_name: self.sender_name.filter(|s| !s.trim().is_empty()),
            sender_number: self.sender_number.trim_start_matches('+').to_string(),
            group_name: self.group_name.filter(|s| !s.trim().is_empty()),
            body: self.body,
            media,
        }
    }
}

/// Parse one stdout line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<SidecarEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SidecarCommand<'a> {
    SendText {
        to: &'a str,
        text: &'a str,
    },
    SendMedia {
        to: &'a str,
        path: &'a Path,
        mime_type: &'a str,
        file_name: &'a str,
        caption: &'a str,
    },
    Logout,
}

impl SidecarCommand<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            SidecarCommand::SendText { .. } => "send_text",
            SidecarCommand::SendMedia { .. } => "send_media",
            SidecarCommand::Logout => "logout",
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    #[serde(flatten)]
    command: &'a SidecarCommand<'a>,
}

/// Serialize a request line, newline included.
pub fn encode_request(id: u64, command: &SidecarCommand<'_>) -> Result<String> {
    let mut line = serde_json::to_string(&Request { id, command })?;
    line.push('\n');
    Ok(line)
}
