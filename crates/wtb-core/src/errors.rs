/// Failures of the relay's own operations.
///
/// Every variant is turned into an operator notice at the point of origin; none of
/// them are fatal to the process.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("a WhatsApp session is already active or pairing")]
    AlreadyConnected,

    #[error("no active WhatsApp session")]
    NotConnected,

    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    #[error("nothing pending")]
    NothingPending,

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("pairing failed: {0}")]
    PairingFailed(String),
}

/// Core error type.
///
/// Adapter crates should map their specific errors into this type so the router
/// can handle failures consistently.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

pub type Result<T> = std::result::Result<T, Error>;
