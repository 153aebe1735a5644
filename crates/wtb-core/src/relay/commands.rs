/// Operator commands understood by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    Start,
    Help,
    /// Pair a WhatsApp account.
    Scan,
    Logout,
    /// `/send <target>`; the target is validated later.
    Send(String),
    Cancel,
    Unknown(String),
}

impl OperatorCommand {
    /// Build from an already split command name (lowercased, no `/`) and its argument.
    pub fn from_parts(name: &str, args: &str) -> Self {
        match name {
            "start" => OperatorCommand::Start,
            "help" => OperatorCommand::Help,
            "scan" => OperatorCommand::Scan,
            "logout" => OperatorCommand::Logout,
            "send" => OperatorCommand::Send(args.trim().to_string()),
            "cancel" => OperatorCommand::Cancel,
            other => OperatorCommand::Unknown(other.to_string()),
        }
    }
}

/// Split `/cmd@botname rest of line` into (`cmd`, `rest of line`).
///
/// Returns `None` for text that isn't a command.
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }

    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    Some((cmd, rest))
}

pub const HELP_TEXT: &str = "<b>WhatsApp-Telegram Bridge Help</b>\n\n\
/scan - generate QR and link WhatsApp\n\
/logout - disconnect WhatsApp\n\
/send &lt;+number&gt; - start sending a new message to a number\n\
/cancel - cancel a pending /send action\n\n\
Reply to a forwarded message to answer that chat.";

pub const WELCOME_TEXT: &str =
    "Welcome! Use /scan to connect your WhatsApp account via QR code. Use /help for commands.";
