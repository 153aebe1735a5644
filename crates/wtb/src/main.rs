use std::sync::Arc;

use tracing::info;

use wtb_core::config::Config;
use wtb_sidecar::SidecarConnector;

#[tokio::main]
async fn main() -> Result<(), wtb_core::Error> {
    wtb_core::logging::init("wtb")?;

    let cfg = Arc::new(Config::load()?);
    info!(
        bridge = %cfg.bridge_cmd.display(),
        auth_dir = %cfg.auth_dir.display(),
        temp_dir = %cfg.temp_dir.display(),
        "starting WhatsApp-Telegram relay"
    );

    let connector = Arc::new(SidecarConnector::new(cfg.clone()));

    wtb_telegram::router::run_polling(cfg, connector)
        .await
        .map_err(|e| wtb_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
