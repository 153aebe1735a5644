//! Remote-side (WhatsApp Web) abstractions.
//!
//! The remote client is an opaque collaborator: the relay starts it per operator,
//! sends through it, and consumes its lifecycle/message events from a channel.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{OperatorId, RemoteChatId},
    media::MediaPayload,
    Result,
};

/// Distinguishes successive sessions of the same operator.
///
/// Events from a sidecar that belonged to an earlier session (e.g. the tail of a
/// logout) carry a stale epoch and are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionEpoch(pub u64);

#[derive(Clone, Debug, PartialEq)]
pub enum RemoteEvent {
    /// A pairing token to show the operator (the QR payload). The sidecar may also
    /// render it to an image.
    PairingChallenge {
        token: String,
        image: Option<PathBuf>,
    },
    Ready,
    Message(RemoteMessage),
    /// The account was logged out or the connection ended after it was ready.
    Disconnected { reason: String },
    /// The client never became ready (auth failure, sidecar crashed during startup).
    InitFailed { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteMessage {
    /// Conversation the message arrived in; replies go back here.
    pub from: RemoteChatId,
    pub sender_name: Option<String>,
    /// Digits only, without `+`.
    pub sender_number: String,
    /// Set for group chats.
    pub group_name: Option<String>,
    pub body: String,
    pub media: Option<RemoteMedia>,
}

/// Attachment announced by the remote side.
///
/// `payload` is `None` when the sidecar could not download the media.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteMedia {
    pub payload: Option<MediaPayload>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteEnvelope {
    pub operator: OperatorId,
    pub epoch: SessionEpoch,
    pub event: RemoteEvent,
}

/// Tagged sender handed to a connector for one session.
#[derive(Clone, Debug)]
pub struct RemoteEventSink {
    operator: OperatorId,
    epoch: SessionEpoch,
    tx: mpsc::UnboundedSender<RemoteEnvelope>,
}

impl RemoteEventSink {
    pub fn new(
        operator: OperatorId,
        epoch: SessionEpoch,
        tx: mpsc::UnboundedSender<RemoteEnvelope>,
    ) -> Self {
        Self {
            operator,
            epoch,
            tx,
        }
    }

    pub fn operator(&self) -> OperatorId {
        self.operator
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    /// Returns `false` once the receiving side is gone.
    pub fn emit(&self, event: RemoteEvent) -> bool {
        self.tx
            .send(RemoteEnvelope {
                operator: self.operator,
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// A running remote client bound to one operator.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn send_text(&self, to: &RemoteChatId, text: &str) -> Result<()>;

    async fn send_media(&self, to: &RemoteChatId, media: &MediaPayload, caption: &str)
        -> Result<()>;

    /// Log the account out and stop the client.
    async fn logout(&self) -> Result<()>;
}

/// Starts remote clients and owns their persisted credentials.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Start a client for `operator` and begin pairing. Lifecycle and message events
    /// are delivered through `sink`.
    async fn connect(
        &self,
        operator: OperatorId,
        sink: RemoteEventSink,
    ) -> Result<Arc<dyn RemoteClient>>;

    /// Invalidate stored credentials so the next connect has to pair again.
    async fn purge_credentials(&self, operator: OperatorId) -> Result<()>;
}
