use std::path::Path;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    media::MediaPayload,
    messaging::types::RelayCapabilities,
    Result,
};

/// Port for the platform that shows relayed messages to operators.
///
/// Every send returns the platform's reference to the new message, which is what the
/// correlation table keys on.
#[async_trait]
pub trait RelayPort: Send + Sync {
    fn capabilities(&self) -> RelayCapabilities;

    async fn send_text(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    /// Send a displayable image. Providers may reject payloads they can't render;
    /// callers fall back to [`RelayPort::send_document`].
    async fn send_image(
        &self,
        chat_id: ChatId,
        media: &MediaPayload,
        caption_html: &str,
    ) -> Result<MessageRef>;

    async fn send_document(
        &self,
        chat_id: ChatId,
        media: &MediaPayload,
        caption_html: &str,
    ) -> Result<MessageRef>;

    /// Download an operator-supplied file to `dest`.
    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()>;
}
