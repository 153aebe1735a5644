use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*, types::BotCommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use wtb_core::messaging::throttled::{ThrottleConfig, ThrottledRelay};
use wtb_core::{
    config::Config, messaging::port::RelayPort, relay::RelayRouter, remote::RemoteConnector,
};

use crate::handlers;
use crate::TelegramRelay;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub router: Arc<RelayRouter>,
}

pub async fn run_polling(
    cfg: Arc<Config>,
    connector: Arc<dyn RemoteConnector>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => info!("wtb started: @{}", me.username()),
        Err(e) => warn!("getMe failed: {e}"),
    }
    if cfg.telegram_allowed_users.is_empty() {
        info!("allowed users: any");
    } else {
        info!("allowed users: {}", cfg.telegram_allowed_users.len());
    }

    if let Err(e) = bot.set_my_commands(bot_commands()).await {
        warn!("failed to register bot commands: {e}");
    }

    // Throttle in front of Telegram so a burst of WhatsApp traffic doesn't run into 429s.
    // The RetryAfter retry stays in the Telegram adapter.
    let raw_relay: Arc<dyn RelayPort> = Arc::new(TelegramRelay::new(bot.clone(), &cfg));
    let relay: Arc<dyn RelayPort> = Arc::new(ThrottledRelay::new(
        raw_relay,
        ThrottleConfig::from(cfg.as_ref()),
    ));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let router = Arc::new(RelayRouter::new(cfg.clone(), relay, connector, events_tx));
    tokio::spawn(router.clone().run_event_pump(events_rx));

    let state = Arc::new(AppState { cfg, router });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("scan", "Link WhatsApp via QR code"),
        BotCommand::new("logout", "Disconnect WhatsApp"),
        BotCommand::new("send", "Send a new message to a number"),
        BotCommand::new("cancel", "Cancel a pending /send"),
        BotCommand::new("help", "Show help"),
    ]
}
