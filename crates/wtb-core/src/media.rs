//! Media payloads exchanged between the two sides.
//!
//! Neither side streams bytes through the relay: attachments are written to the
//! temp dir and handed over by path.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use chrono::Utc;

static MEDIA_COUNTER: AtomicUsize = AtomicUsize::new(1);

pub const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaPayload {
    pub path: PathBuf,
    pub mime_type: String,
    pub file_name: String,
}

/// Which relay-side send primitive a payload prefers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    /// Displayable inline (Telegram photo).
    Visual,
    /// Anything else (Telegram document).
    Generic,
}

impl MediaPayload {
    pub fn new(
        path: impl Into<PathBuf>,
        mime_type: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
            file_name: file_name.into(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        classify_mime(&self.mime_type)
    }

    pub fn extension(&self) -> String {
        extension_from_mime(Some(&self.mime_type))
    }

    /// Same file, different advertised name.
    pub fn renamed(&self, file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..self.clone()
        }
    }
}

pub fn classify_mime(mime: &str) -> MediaKind {
    if mime.trim().to_ascii_lowercase().starts_with("image/") {
        MediaKind::Visual
    } else {
        MediaKind::Generic
    }
}

/// File extension for a MIME type, `bin` when unknown.
pub fn extension_from_mime(mime: Option<&str>) -> String {
    let Some(mime) = mime else {
        return "bin".to_string();
    };
    let Some(sub) = mime.split_once('/').map(|(_, s)| s.trim()) else {
        return "bin".to_string();
    };
    if sub.is_empty() {
        return "bin".to_string();
    }
    // Drop parameters such as `; codecs=opus`.
    let sub = sub.split(';').next().unwrap_or(sub).trim();

    if sub.contains("jpeg") || sub == "jpg" {
        return "jpg".to_string();
    }
    if sub.contains("png") {
        return "png".to_string();
    }
    if sub.contains("gif") {
        return "gif".to_string();
    }
    if sub.contains("mp4") {
        return "mp4".to_string();
    }
    if sub.contains("mpeg") {
        return "mp3".to_string();
    }
    sub.to_string()
}

/// Keep only characters that are safe in a file name.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.trim_matches('.').is_empty() {
        "file".to_string()
    } else {
        out
    }
}

/// A fresh path under `dir` for a downloaded attachment.
pub fn unique_media_path(dir: &Path, file_name: &str) -> PathBuf {
    let ts = Utc::now().timestamp_millis();
    let n = MEDIA_COUNTER.fetch_add(1, Ordering::SeqCst);
    let base = sanitize_filename(file_name);
    let name = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{stem}_{ts}_{n}.{ext}")
        }
        _ => format!("{base}_{ts}_{n}"),
    };
    dir.join(name)
}
