//! Telegram adapter (teloxide).
//!
//! This crate implements the `wtb-core` RelayPort over the Telegram Bot API and
//! feeds operator updates into the relay router.

use std::path::Path;

use async_trait::async_trait;

use teloxide::{
    net::Download,
    prelude::*,
    types::{InputFile, ParseMode},
};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use wtb_core::{
    config::Config,
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    media::MediaPayload,
    messaging::{port::RelayPort, types::RelayCapabilities},
    Result,
};

#[derive(Clone)]
pub struct TelegramRelay {
    bot: Bot,
    max_message_len: usize,
    max_caption_len: usize,
}

impl TelegramRelay {
    pub fn new(bot: Bot, cfg: &Config) -> Self {
        Self {
            bot,
            max_message_len: cfg.telegram_message_limit,
            max_caption_len: cfg.telegram_caption_limit,
        }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn sent(chat_id: ChatId, msg: &Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }

    fn input_file(media: &MediaPayload) -> InputFile {
        InputFile::file(media.path.clone()).file_name(media.file_name.clone())
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl RelayPort for TelegramRelay {
    fn capabilities(&self) -> RelayCapabilities {
        RelayCapabilities {
            max_message_len: self.max_message_len,
            max_caption_len: self.max_caption_len,
        }
    }

    async fn send_text(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn send_image(
        &self,
        chat_id: ChatId,
        media: &MediaPayload,
        caption_html: &str,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                let mut req = self
                    .bot
                    .send_photo(Self::tg_chat(chat_id), Self::input_file(media));
                if !caption_html.is_empty() {
                    req = req
                        .caption(caption_html.to_string())
                        .parse_mode(ParseMode::Html);
                }
                req
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        media: &MediaPayload,
        caption_html: &str,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                let mut req = self
                    .bot
                    .send_document(Self::tg_chat(chat_id), Self::input_file(media));
                if !caption_html.is_empty() {
                    req = req
                        .caption(caption_html.to_string())
                        .parse_mode(ParseMode::Html);
                }
                req
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
        let file = self
            .with_retry(|| self.bot.get_file(file_id.to_string()))
            .await?;
        let mut dst = tokio::fs::File::create(dest).await?;
        self.bot
            .download_file(&file.path, &mut dst)
            .await
            .map_err(|e| Error::External(format!("telegram download failed: {e}")))?;
        Ok(())
    }
}
