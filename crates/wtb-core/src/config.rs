use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Telegram rejects photo/document captions longer than this.
pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;

/// Typed configuration, loaded from the environment (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    /// Empty means every Telegram user may operate their own session.
    pub telegram_allowed_users: Vec<i64>,
    pub telegram_message_limit: usize,
    pub telegram_caption_limit: usize,

    // WhatsApp sidecar
    pub bridge_cmd: PathBuf,
    pub bridge_args: Vec<String>,
    pub auth_dir: PathBuf,

    // Runtime
    pub temp_dir: PathBuf,
    pub correlation_capacity: usize,

    // Outbound throttling
    pub throttle_global: Duration,
    pub throttle_per_chat: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let telegram_allowed_users = parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS"));
        let telegram_message_limit = env_usize("TELEGRAM_MESSAGE_LIMIT").unwrap_or(4096);

        let bridge_cmd = env_path("WA_BRIDGE_CMD").unwrap_or_else(|| PathBuf::from("wa-bridge"));
        let bridge_args = env_str("WA_BRIDGE_ARGS")
            .map(|s| s.split_whitespace().map(|a| a.to_string()).collect())
            .unwrap_or_default();
        let auth_dir = env_path("WA_AUTH_DIR").unwrap_or_else(|| PathBuf::from(".wwebjs_auth"));

        let temp_dir = env_path("TEMP_DIR").unwrap_or_else(|| PathBuf::from("/tmp/wtb"));
        fs::create_dir_all(&temp_dir)?;

        let correlation_capacity = env_usize("CORRELATION_CAPACITY").unwrap_or(10_000);

        let throttle_global = Duration::from_millis(env_u64("THROTTLE_GLOBAL_MS").unwrap_or(40));
        let throttle_per_chat =
            Duration::from_millis(env_u64("THROTTLE_PER_CHAT_MS").unwrap_or(1050));

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            telegram_message_limit,
            telegram_caption_limit: TELEGRAM_CAPTION_LIMIT,
            bridge_cmd,
            bridge_args,
            auth_dir,
            temp_dir,
            correlation_capacity,
            throttle_global,
            throttle_per_chat,
        })
    }

    /// Where the sidecar keeps credentials for one operator.
    pub fn credentials_dir(&self, client_id: &str) -> PathBuf {
        self.auth_dir.join(client_id)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}
