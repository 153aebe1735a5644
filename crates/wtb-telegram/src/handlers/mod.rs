//! Telegram update handlers.
//!
//! Authorize the sender, turn the teloxide `Message` into a relay `IncomingUpdate`
//! and hand it to the router.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::{debug, warn};

use wtb_core::{
    domain::{ChatId, MessageId, UserId},
    messaging::types::{Command, ContentBody, ContentMessage, IncomingUpdate},
    relay::commands::parse_command,
    security::is_authorized,
};

use crate::router::AppState;

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let user_id = msg.from().map(|u| UserId(u.id.0 as i64));

    if !is_authorized(user_id, &state.cfg.telegram_allowed_users) {
        warn!(chat = msg.chat.id.0, user = ?user_id, "unauthorized update");
        let _ = bot
            .send_message(
                msg.chat.id,
                "Unauthorized. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }
    let Some(user_id) = user_id else {
        return Ok(());
    };

    let update = to_update(&msg, user_id);
    debug!(chat = msg.chat.id.0, "update: {}", describe(&update));
    state.router.handle_update(update).await;
    Ok(())
}

fn to_update(msg: &Message, user_id: UserId) -> IncomingUpdate {
    let chat_id = ChatId(msg.chat.id.0);

    if let Some((name, args)) = msg.text().and_then(parse_command) {
        return IncomingUpdate::Command(Command {
            chat_id,
            user_id,
            name,
            args,
        });
    }

    IncomingUpdate::Content(ContentMessage {
        chat_id,
        user_id,
        reply_to: msg.reply_to_message().map(|m| MessageId(m.id.0)),
        body: content_body(msg),
    })
}

fn content_body(msg: &Message) -> ContentBody {
    let caption = msg.caption().map(str::to_string);

    if let Some(text) = msg.text() {
        return ContentBody::Text(text.to_string());
    }
    if let Some(best) = msg.photo().and_then(|sizes| sizes.last()) {
        return ContentBody::Photo {
            file_id: best.file.id.clone(),
            caption,
        };
    }
    if let Some(doc) = msg.document() {
        return ContentBody::Document {
            file_id: doc.file.id.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.as_ref().map(ToString::to_string),
            caption,
        };
    }

    let kind = if msg.sticker().is_some() {
        "sticker"
    } else if msg.voice().is_some() {
        "voice"
    } else if msg.audio().is_some() {
        "audio"
    } else if msg.video().is_some() {
        "video"
    } else if msg.animation().is_some() {
        "animation"
    } else if msg.location().is_some() {
        "location"
    } else if msg.contact().is_some() {
        "contact"
    } else {
        "other"
    };
    ContentBody::Unsupported {
        kind: kind.to_string(),
    }
}

/// Short description for debug logs; never includes message text.
fn describe(update: &IncomingUpdate) -> String {
    match update {
        IncomingUpdate::Command(c) => format!("/{}", c.name),
        IncomingUpdate::Content(c) => {
            let kind = match &c.body {
                ContentBody::Text(_) => "text",
                ContentBody::Photo { .. } => "photo",
                ContentBody::Document { .. } => "document",
                ContentBody::Unsupported { kind } => kind.as_str(),
            };
            match c.reply_to {
                Some(id) => format!("{kind} (reply to {})", id.0),
                None => kind.to_string(),
            }
        }
    }
}
