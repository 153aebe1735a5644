use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    domain::{MessageId, MessageRef, OperatorId, RemoteChatId},
    errors::RelayError,
    formatting::{escape_html, truncate_chars},
    media::{unique_media_path, MediaKind, MediaPayload, DEFAULT_MIME},
    messaging::{
        port::RelayPort,
        types::{Command, ContentBody, ContentMessage, IncomingUpdate},
    },
    relay::{
        address::RemoteAddress,
        commands::{OperatorCommand, HELP_TEXT, WELCOME_TEXT},
        locks::OperatorLocks,
        pending::{PendingSend, PendingSends},
        registry::{SessionRegistry, SessionState},
    },
    remote::{
        RemoteClient, RemoteConnector, RemoteEnvelope, RemoteEvent, RemoteEventSink,
        RemoteMessage, SessionEpoch,
    },
    Result,
};

const QR_CAPTION: &str = "Scan this QR code with WhatsApp to connect.";
const READY_NOTICE: &str = "✅ WhatsApp client connected and ready!";
const DISCONNECTED_NOTICE: &str =
    "⚠️ WhatsApp client disconnected (logged out). Use /scan to reconnect.";
const INIT_FAILED_NOTICE: &str = "Failed to initialize WhatsApp client. Check logs.";

#[derive(Default)]
struct RelayState {
    registry: SessionRegistry,
    pending: PendingSends,
}

/// How a `/logout` went. The session is gone either way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    LoggedOut,
    LogoutFailed(String),
}

/// Operator content ready to hand to the remote client, by the kind it was sent as.
enum Outbound {
    Text(String),
    Photo {
        payload: MediaPayload,
        caption: String,
    },
    Document {
        payload: MediaPayload,
        caption: String,
    },
}

impl Outbound {
    fn temp_file(&self) -> Option<PathBuf> {
        match self {
            Outbound::Text(_) => None,
            Outbound::Photo { payload, .. } | Outbound::Document { payload, .. } => {
                Some(payload.path.clone())
            }
        }
    }
}

/// The relay's single context object.
///
/// Owns the session registry (with each session's correlation table) and the
/// pending-send states, and routes between the relay port and the remote clients.
/// Every entry point takes the operator's lock first, so one operator's inputs and
/// remote events are applied strictly in order.
pub struct RelayRouter {
    cfg: Arc<Config>,
    relay: Arc<dyn RelayPort>,
    connector: Arc<dyn RemoteConnector>,
    events: mpsc::UnboundedSender<RemoteEnvelope>,
    state: Mutex<RelayState>,
    locks: OperatorLocks,
}

impl RelayRouter {
    /// `events` is the sending half of the channel the remote clients report into;
    /// feed the receiving half to [`RelayRouter::run_event_pump`].
    pub fn new(
        cfg: Arc<Config>,
        relay: Arc<dyn RelayPort>,
        connector: Arc<dyn RemoteConnector>,
        events: mpsc::UnboundedSender<RemoteEnvelope>,
    ) -> Self {
        let state = RelayState {
            registry: SessionRegistry::new(cfg.correlation_capacity),
            pending: PendingSends::default(),
        };
        Self {
            cfg,
            relay,
            connector,
            events,
            state: Mutex::new(state),
            locks: OperatorLocks::default(),
        }
    }

    // ============== Queries ==============

    pub async fn session_state(&self, operator: OperatorId) -> Option<SessionState> {
        self.state
            .lock()
            .await
            .registry
            .get(operator)
            .map(|s| s.state())
    }

    pub async fn pending_state(&self, operator: OperatorId) -> PendingSend {
        self.state.lock().await.pending.state(operator)
    }

    /// Remote conversation a relayed message came from.
    pub async fn resolve(&self, operator: OperatorId, message: MessageId) -> Option<RemoteChatId> {
        self.state
            .lock()
            .await
            .registry
            .get(operator)
            .and_then(|s| s.correlations().resolve(message).cloned())
    }

    // ============== Operations ==============

    /// Start pairing a WhatsApp account for `operator`.
    pub async fn open_session(&self, operator: OperatorId) -> Result<SessionEpoch> {
        let _guard = self.locks.lock(operator).await;
        self.open_locked(operator).await
    }

    /// Log out and forget the operator's session.
    pub async fn close_session(&self, operator: OperatorId) -> Result<CloseOutcome> {
        let _guard = self.locks.lock(operator).await;
        self.close_locked(operator).await
    }

    /// Arm a `/send`: the operator's next content goes to `raw_target`.
    pub async fn request_send(
        &self,
        operator: OperatorId,
        raw_target: &str,
    ) -> Result<RemoteAddress> {
        let _guard = self.locks.lock(operator).await;
        self.request_send_locked(operator, raw_target).await
    }

    pub async fn cancel_send(&self, operator: OperatorId) -> Result<RemoteAddress> {
        let _guard = self.locks.lock(operator).await;
        Ok(self.state.lock().await.pending.cancel(operator)?)
    }

    // ============== Relay side (Telegram → WhatsApp) ==============

    /// Entry point for everything the operator sends to the bot.
    pub async fn handle_update(&self, update: IncomingUpdate) {
        let operator = OperatorId::from(update.chat_id());
        let _guard = self.locks.lock(operator).await;
        match update {
            IncomingUpdate::Command(cmd) => self.handle_command_locked(operator, &cmd).await,
            IncomingUpdate::Content(msg) => self.handle_content_locked(operator, msg).await,
        }
    }

    async fn handle_command_locked(&self, operator: OperatorId, cmd: &Command) {
        debug!(operator = %operator, user = cmd.user_id.0, command = %cmd.name, "operator command");

        match OperatorCommand::from_parts(&cmd.name, &cmd.args) {
            OperatorCommand::Start => self.notify(operator, WELCOME_TEXT).await,
            OperatorCommand::Help => self.notify(operator, HELP_TEXT).await,

            OperatorCommand::Scan => match self.open_locked(operator).await {
                Ok(_) => {}
                Err(crate::Error::Relay(RelayError::AlreadyConnected)) => {
                    self.notify(
                        operator,
                        "You are already connected. Use /logout to disconnect first.",
                    )
                    .await
                }
                Err(e) => {
                    error!(operator = %operator, "failed to start WhatsApp client: {e}");
                    self.notify(operator, INIT_FAILED_NOTICE).await;
                }
            },

            OperatorCommand::Logout => match self.close_locked(operator).await {
                Ok(CloseOutcome::LoggedOut) => {
                    self.notify(operator, "Logged out from WhatsApp.").await
                }
                Ok(CloseOutcome::LogoutFailed(_)) => {
                    self.notify(operator, "Error while logging out. Check logs.")
                        .await
                }
                Err(_) => self.notify(operator, "You are not connected.").await,
            },

            OperatorCommand::Send(raw) => match self.request_send_locked(operator, &raw).await {
                Ok(target) => {
                    self.notify(
                        operator,
                        &format!(
                            "Send the message (text or image) you want to deliver to {target}. Use /cancel to abort."
                        ),
                    )
                    .await
                }
                Err(crate::Error::Relay(RelayError::InvalidTarget(_))) => {
                    self.notify(operator, "Invalid number format. Use e.g. /send +1234567890")
                        .await
                }
                Err(_) => {
                    self.notify(operator, "You must connect first with /scan.")
                        .await
                }
            },

            OperatorCommand::Cancel => {
                let cancelled = self.state.lock().await.pending.cancel(operator);
                let text = match cancelled {
                    Ok(_) => "Operation cancelled.",
                    Err(_) => "Nothing to cancel.",
                };
                self.notify(operator, text).await;
            }

            OperatorCommand::Unknown(name) => {
                debug!(operator = %operator, "ignoring unknown command /{name}");
            }
        }
    }

    async fn open_locked(&self, operator: OperatorId) -> Result<SessionEpoch> {
        let epoch = self.state.lock().await.registry.open(operator)?;
        info!(operator = %operator, epoch = epoch.0, "starting WhatsApp client");
        self.notify(operator, "Generating QR code...").await;

        let sink = RemoteEventSink::new(operator, epoch, self.events.clone());
        match self.connector.connect(operator, sink).await {
            Ok(client) => {
                self.state
                    .lock()
                    .await
                    .registry
                    .attach_client(operator, epoch, client);
                Ok(epoch)
            }
            Err(e) => {
                self.state
                    .lock()
                    .await
                    .registry
                    .remove_current(operator, epoch);
                Err(RelayError::PairingFailed(e.to_string()).into())
            }
        }
    }

    async fn close_locked(&self, operator: OperatorId) -> Result<CloseOutcome> {
        let client = {
            let st = self.state.lock().await;
            st.registry
                .get(operator)
                .ok_or(RelayError::NotConnected)?
                .client()
        };

        let outcome = match client {
            Some(client) => match client.logout().await {
                Ok(()) => CloseOutcome::LoggedOut,
                Err(e) => {
                    error!(operator = %operator, "logout error: {e}");
                    CloseOutcome::LogoutFailed(e.to_string())
                }
            },
            None => CloseOutcome::LoggedOut,
        };

        let closed = self.state.lock().await.registry.close(operator)?;
        info!(
            operator = %operator,
            epoch = closed.epoch().0,
            relayed = closed.correlations().len(),
            "WhatsApp session closed"
        );

        // A failed logout may leave usable credentials behind; drop them so the
        // next /scan pairs from scratch.
        if matches!(outcome, CloseOutcome::LogoutFailed(_)) {
            self.purge_credentials(operator).await;
        }
        Ok(outcome)
    }

    async fn request_send_locked(
        &self,
        operator: OperatorId,
        raw_target: &str,
    ) -> Result<RemoteAddress> {
        let mut st = self.state.lock().await;
        st.registry.ready_client(operator)?;
        Ok(st.pending.request_send(operator, raw_target)?)
    }

    async fn handle_content_locked(&self, operator: OperatorId, msg: ContentMessage) {
        enum Route {
            Pending(RemoteAddress),
            Reply(RemoteChatId),
        }

        let (client, route) = {
            let mut st = self.state.lock().await;
            let Ok(client) = st.registry.ready_client(operator) else {
                return; // not connected
            };

            if let Some(target) = st.pending.take(operator) {
                (client, Route::Pending(target))
            } else {
                let resolved = msg.reply_to.and_then(|id| {
                    st.registry
                        .get(operator)
                        .and_then(|s| s.correlations().resolve(id).cloned())
                });
                let Some(chat) = resolved else {
                    return; // not part of any tracked flow
                };
                (client, Route::Reply(chat))
            }
        };

        match route {
            Route::Pending(target) => self.deliver_pending(operator, client, target, msg).await,
            Route::Reply(chat) => self.deliver_reply(operator, client, chat, msg).await,
        }
    }

    async fn deliver_pending(
        &self,
        operator: OperatorId,
        client: Arc<dyn RemoteClient>,
        target: RemoteAddress,
        msg: ContentMessage,
    ) {
        self.notify(operator, &format!("Sending your message to {target}..."))
            .await;

        let outbound = match self.prepare_outbound(&msg.body, "image.jpg").await {
            Ok(Some(o)) => o,
            Ok(None) => {
                self.notify(
                    operator,
                    "Unsupported message type for /send. Use text, photo or document.",
                )
                .await;
                return;
            }
            Err(e) => {
                error!(operator = %operator, "failed to fetch /send content: {e}");
                self.notify(
                    operator,
                    &format!("❌ Failed to send message to {target}. Check logs."),
                )
                .await;
                return;
            }
        };

        let label = match &outbound {
            Outbound::Text(_) => "Message",
            Outbound::Photo { .. } => "Image",
            Outbound::Document { .. } => "Document",
        };
        let result = send_outbound(client.as_ref(), &target.chat_id(), &outbound).await;
        remove_temp_file(outbound.temp_file()).await;

        match result {
            Ok(()) => {
                info!(operator = %operator, to = %target.chat_id(), "delivered /send content");
                self.notify(operator, &format!("✅ {label} sent to {target}"))
                    .await
            }
            Err(e) => {
                error!(operator = %operator, "error sending /send content to WhatsApp: {e}");
                self.notify(
                    operator,
                    &format!("❌ Failed to send message to {target}. Check logs."),
                )
                .await
            }
        }
    }

    async fn deliver_reply(
        &self,
        operator: OperatorId,
        client: Arc<dyn RemoteClient>,
        chat: RemoteChatId,
        msg: ContentMessage,
    ) {
        let outbound = match self.prepare_outbound(&msg.body, "reply.jpg").await {
            Ok(Some(o)) => o,
            Ok(None) => {
                debug!(operator = %operator, "unsupported reply content, ignoring");
                return;
            }
            Err(e) => {
                error!(operator = %operator, "failed to fetch reply content: {e}");
                self.notify(operator, "❌ Failed to send reply to WhatsApp.")
                    .await;
                return;
            }
        };

        let notice = match &outbound {
            Outbound::Text(_) => "✅ Reply sent to WhatsApp!",
            Outbound::Photo { .. } => "✅ Image reply sent to WhatsApp!",
            Outbound::Document { .. } => "✅ Document reply sent to WhatsApp!",
        };
        let result = send_outbound(client.as_ref(), &chat, &outbound).await;
        remove_temp_file(outbound.temp_file()).await;

        match result {
            Ok(()) => self.notify(operator, notice).await,
            Err(e) => {
                error!(operator = %operator, to = %chat, "failed to forward reply to WhatsApp: {e}");
                self.notify(operator, "❌ Failed to send reply to WhatsApp.")
                    .await
            }
        }
    }

    /// Download operator media into the temp dir. `None` for content kinds the
    /// remote side can't take.
    async fn prepare_outbound(
        &self,
        body: &ContentBody,
        photo_name: &str,
    ) -> Result<Option<Outbound>> {
        match body {
            ContentBody::Text(text) => Ok(Some(Outbound::Text(text.clone()))),
            ContentBody::Photo { file_id, caption } => {
                let path = unique_media_path(&self.cfg.temp_dir, photo_name);
                self.relay.download_file(file_id, &path).await?;
                Ok(Some(Outbound::Photo {
                    payload: MediaPayload::new(path, "image/jpeg", photo_name),
                    caption: caption.clone().unwrap_or_default(),
                }))
            }
            ContentBody::Document {
                file_id,
                file_name,
                mime_type,
                caption,
            } => {
                let file_name = file_name.clone().unwrap_or_else(|| "file".to_string());
                let mime_type = mime_type
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_MIME.to_string());
                let path = unique_media_path(&self.cfg.temp_dir, &file_name);
                self.relay.download_file(file_id, &path).await?;
                Ok(Some(Outbound::Document {
                    payload: MediaPayload::new(path, mime_type, file_name),
                    caption: caption.clone().unwrap_or_default(),
                }))
            }
            ContentBody::Unsupported { .. } => Ok(None),
        }
    }

    // ============== Remote side (WhatsApp → Telegram) ==============

    /// Apply one remote event. Events from a session that no longer exists are dropped.
    pub async fn handle_remote_event(&self, envelope: RemoteEnvelope) {
        let RemoteEnvelope {
            operator,
            epoch,
            event,
        } = envelope;
        let _guard = self.locks.lock(operator).await;

        if !self.state.lock().await.registry.is_current(operator, epoch) {
            debug!(operator = %operator, epoch = epoch.0, "dropping event from stale session");
            return;
        }

        match event {
            RemoteEvent::PairingChallenge { token, image } => {
                self.deliver_pairing_challenge(operator, &token, image).await
            }
            RemoteEvent::Ready => {
                self.state.lock().await.registry.mark_ready(operator, epoch);
                info!(operator = %operator, "WhatsApp client ready");
                self.notify(operator, READY_NOTICE).await;
            }
            RemoteEvent::Message(msg) => self.relay_inbound(operator, epoch, msg).await,
            RemoteEvent::Disconnected { reason } | RemoteEvent::InitFailed { reason } => {
                self.handle_disconnect(operator, epoch, &reason).await
            }
        }
    }

    async fn deliver_pairing_challenge(
        &self,
        operator: OperatorId,
        token: &str,
        image: Option<PathBuf>,
    ) {
        let chat = operator.chat();
        let Some(image) = image else {
            let text = format!("{QR_CAPTION}\n\n<code>{}</code>", escape_html(token));
            self.notify(operator, &text).await;
            return;
        };

        let qr = MediaPayload::new(image, "image/png", "qrcode.png");
        if let Err(e) = self.relay.send_image(chat, &qr, QR_CAPTION).await {
            warn!(operator = %operator, "sending QR as photo failed, trying document: {e}");
            if let Err(e) = self.relay.send_document(chat, &qr, QR_CAPTION).await {
                error!(operator = %operator, "sending QR as document failed: {e}");
                self.notify(operator, "Failed to send QR. Check logs.").await;
            }
        }
        remove_temp_file(Some(qr.path)).await;
    }

    async fn handle_disconnect(&self, operator: OperatorId, epoch: SessionEpoch, reason: &str) {
        let Some(session) = self
            .state
            .lock()
            .await
            .registry
            .remove_current(operator, epoch)
        else {
            return;
        };
        let was_ready = session.ready_at().is_some();
        drop(session);

        info!(operator = %operator, was_ready, "WhatsApp client disconnected: {reason}");
        self.purge_credentials(operator).await;

        let notice = if was_ready {
            DISCONNECTED_NOTICE
        } else {
            INIT_FAILED_NOTICE
        };
        self.notify(operator, notice).await;
    }

    async fn relay_inbound(&self, operator: OperatorId, epoch: SessionEpoch, msg: RemoteMessage) {
        let ready = self
            .state
            .lock()
            .await
            .registry
            .get(operator)
            .is_some_and(|s| s.is_ready());
        if !ready {
            debug!(operator = %operator, "message before ready, dropping");
            return;
        }

        let sent = match &msg.media {
            None => {
                let text = self.inbound_text(&msg, self.relay.capabilities().max_message_len);
                self.relay
                    .send_text(operator.chat(), &text)
                    .await
                    .map_err(delivery_failed)
            }
            Some(media) => {
                let Some(payload) = &media.payload else {
                    warn!(operator = %operator, from = %msg.from, "media download returned nothing");
                    return;
                };
                let caption = self.inbound_text(&msg, self.relay.capabilities().max_caption_len);
                let sent = self.relay_media(operator, payload, &caption).await;
                remove_temp_file(Some(payload.path.clone())).await;
                sent
            }
        };

        let sent = match sent {
            Ok(sent) => sent,
            Err(e) => {
                error!(operator = %operator, from = %msg.from, "dropping inbound message: {e}");
                return;
            }
        };

        let mut st = self.state.lock().await;
        if let Some(session) = st.registry.get_current_mut(operator, epoch) {
            session
                .correlations_mut()
                .record(sent.message_id, msg.from.clone());
        }
    }

    /// Photo first for images, document otherwise or as fallback.
    async fn relay_media(
        &self,
        operator: OperatorId,
        payload: &MediaPayload,
        caption: &str,
    ) -> Result<MessageRef> {
        let chat = operator.chat();
        if payload.kind() == MediaKind::Visual {
            match self.relay.send_image(chat, payload, caption).await {
                Ok(sent) => return Ok(sent),
                Err(e) => {
                    warn!(operator = %operator, "sendPhoto failed, trying sendDocument: {e}")
                }
            }
            let fallback = payload.renamed(format!("file.{}", payload.extension()));
            return self
                .relay
                .send_document(chat, &fallback, caption)
                .await
                .map_err(delivery_failed);
        }

        self.relay
            .send_document(chat, payload, caption)
            .await
            .map_err(delivery_failed)
    }

    /// Sender header plus body, cut so the rendered text fits `limit` characters.
    fn inbound_text(&self, msg: &RemoteMessage, limit: usize) -> String {
        let number = format!("+{}", msg.sender_number.trim_start_matches('+'));
        let name = msg
            .sender_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&number);
        let group = msg
            .group_name
            .as_deref()
            .map(|g| format!(" in group \"{g}\""))
            .unwrap_or_default();

        let header = format!("New message from {name} ({number}){group}:");
        let room = limit.saturating_sub(header.chars().count() + 2);
        let body = truncate_chars(&msg.body, room);

        format!("<b>{}</b>\n\n{}", escape_html(&header), escape_html(&body))
    }

    // ============== Helpers ==============

    async fn notify(&self, operator: OperatorId, html: &str) {
        if let Err(e) = self.relay.send_text(operator.chat(), html).await {
            warn!(operator = %operator, "failed to notify operator: {e}");
        }
    }

    async fn purge_credentials(&self, operator: OperatorId) {
        if let Err(e) = self.connector.purge_credentials(operator).await {
            warn!(operator = %operator, "failed to delete session credentials: {e}");
        }
    }

    /// Dispatch remote events to one worker per operator: in order within an
    /// operator, concurrently across operators. Returns when every sender is gone.
    pub async fn run_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RemoteEnvelope>,
    ) {
        let mut workers: HashMap<OperatorId, mpsc::UnboundedSender<RemoteEnvelope>> =
            HashMap::new();

        while let Some(envelope) = events.recv().await {
            let operator = envelope.operator;
            let envelope = match workers.get(&operator) {
                Some(tx) => match tx.send(envelope) {
                    Ok(()) => continue,
                    Err(mpsc::error::SendError(envelope)) => envelope,
                },
                None => envelope,
            };

            let (tx, mut rx) = mpsc::unbounded_channel::<RemoteEnvelope>();
            let router = self.clone();
            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    router.handle_remote_event(envelope).await;
                }
            });
            // The worker was just spawned and holds `rx`, so this cannot fail.
            let _ = tx.send(envelope);
            workers.insert(operator, tx);
        }
    }
}

async fn send_outbound(
    client: &dyn RemoteClient,
    to: &RemoteChatId,
    outbound: &Outbound,
) -> Result<()> {
    let sent = match outbound {
        Outbound::Text(text) => client.send_text(to, text).await,
        Outbound::Photo { payload, caption } | Outbound::Document { payload, caption } => {
            client.send_media(to, payload, caption).await
        }
    };
    sent.map_err(delivery_failed)
}

fn delivery_failed(e: crate::Error) -> crate::Error {
    RelayError::DeliveryFailed(e.to_string()).into()
}

async fn remove_temp_file(path: Option<PathBuf>) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = tokio::fs::remove_file(&path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("failed to remove temp file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChatId, UserId},
        messaging::types::RelayCapabilities,
        remote::RemoteMedia,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const OP: OperatorId = OperatorId(100);

    #[derive(Clone, Debug)]
    struct Sent {
        kind: &'static str,
        chat: ChatId,
        text: String,
        file_name: Option<String>,
        message_id: MessageId,
    }

    #[derive(Default)]
    struct FakeRelay {
        next_id: StdMutex<i32>,
        sent: StdMutex<Vec<Sent>>,
        downloads: StdMutex<Vec<String>>,
        fail_images: AtomicBool,
        fail_documents: AtomicBool,
    }

    impl FakeRelay {
        fn record(
            &self,
            kind: &'static str,
            chat: ChatId,
            text: &str,
            file_name: Option<String>,
        ) -> MessageRef {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let message_id = MessageId(*next);
            self.sent.lock().unwrap().push(Sent {
                kind,
                chat,
                text: text.to_string(),
                file_name,
                message_id,
            });
            MessageRef {
                chat_id: chat,
                message_id,
            }
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn texts(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter(|s| s.kind == "text")
                .map(|s| s.text)
                .collect()
        }

        fn last_text(&self) -> String {
            self.texts().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl RelayPort for FakeRelay {
        fn capabilities(&self) -> RelayCapabilities {
            RelayCapabilities {
                max_message_len: 4096,
                max_caption_len: 1024,
            }
        }

        async fn send_text(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            Ok(self.record("text", chat_id, html, None))
        }

        async fn send_image(
            &self,
            chat_id: ChatId,
            media: &MediaPayload,
            caption_html: &str,
        ) -> Result<MessageRef> {
            if self.fail_images.load(Ordering::SeqCst) {
                return Err(crate::Error::External("PHOTO_INVALID_DIMENSIONS".to_string()));
            }
            Ok(self.record("image", chat_id, caption_html, Some(media.file_name.clone())))
        }

        async fn send_document(
            &self,
            chat_id: ChatId,
            media: &MediaPayload,
            caption_html: &str,
        ) -> Result<MessageRef> {
            if self.fail_documents.load(Ordering::SeqCst) {
                return Err(crate::Error::External("document rejected".to_string()));
            }
            Ok(self.record("document", chat_id, caption_html, Some(media.file_name.clone())))
        }

        async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
            self.downloads.lock().unwrap().push(file_id.to_string());
            std::fs::write(dest, b"fake")?;
            Ok(())
        }
    }

    #[derive(Clone, Debug)]
    struct RemoteSend {
        to: RemoteChatId,
        text: String,
        media: Option<MediaPayload>,
        media_existed: bool,
    }

    #[derive(Default)]
    struct FakeRemote {
        sent: StdMutex<Vec<RemoteSend>>,
        logouts: AtomicUsize,
        fail_sends: AtomicBool,
        fail_logout: AtomicBool,
    }

    impl FakeRemote {
        fn sent(&self) -> Vec<RemoteSend> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteClient for FakeRemote {
        async fn send_text(&self, to: &RemoteChatId, text: &str) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(crate::Error::External("chat not found".to_string()));
            }
            self.sent.lock().unwrap().push(RemoteSend {
                to: to.clone(),
                text: text.to_string(),
                media: None,
                media_existed: false,
            });
            Ok(())
        }

        async fn send_media(
            &self,
            to: &RemoteChatId,
            media: &MediaPayload,
            caption: &str,
        ) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(crate::Error::External("chat not found".to_string()));
            }
            self.sent.lock().unwrap().push(RemoteSend {
                to: to.clone(),
                text: caption.to_string(),
                media: Some(media.clone()),
                media_existed: media.path.exists(),
            });
            Ok(())
        }

        async fn logout(&self) -> Result<()> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            if self.fail_logout.load(Ordering::SeqCst) {
                return Err(crate::Error::External("browser closed".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        remote: Arc<FakeRemote>,
        sinks: StdMutex<Vec<RemoteEventSink>>,
        purged: StdMutex<Vec<OperatorId>>,
        fail_connect: AtomicBool,
    }

    impl FakeConnector {
        fn last_sink(&self) -> RemoteEventSink {
            self.sinks.lock().unwrap().last().cloned().expect("a connect call")
        }

        fn connects(&self) -> usize {
            self.sinks.lock().unwrap().len()
        }

        fn purged(&self) -> Vec<OperatorId> {
            self.purged.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteConnector for FakeConnector {
        async fn connect(
            &self,
            _operator: OperatorId,
            sink: RemoteEventSink,
        ) -> Result<Arc<dyn RemoteClient>> {
            self.sinks.lock().unwrap().push(sink);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(crate::Error::External("wa-bridge: not found".to_string()));
            }
            Ok(self.remote.clone())
        }

        async fn purge_credentials(&self, operator: OperatorId) -> Result<()> {
            self.purged.lock().unwrap().push(operator);
            Ok(())
        }
    }

    fn test_config() -> Arc<Config> {
        let temp_dir = std::path::PathBuf::from(format!("/tmp/wtb-test-{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir).unwrap();
        Arc::new(Config {
            telegram_bot_token: "x".to_string(),
            telegram_allowed_users: vec![],
            telegram_message_limit: 4096,
            telegram_caption_limit: 1024,
            bridge_cmd: "wa-bridge".into(),
            bridge_args: vec![],
            auth_dir: "/tmp/wtb-test-auth".into(),
            temp_dir,
            correlation_capacity: 0,
            throttle_global: Duration::ZERO,
            throttle_per_chat: Duration::ZERO,
        })
    }

    struct Harness {
        router: Arc<RelayRouter>,
        relay: Arc<FakeRelay>,
        connector: Arc<FakeConnector>,
        events: mpsc::UnboundedReceiver<RemoteEnvelope>,
    }

    impl Harness {
        fn new() -> Self {
            let relay = Arc::new(FakeRelay::default());
            let connector = Arc::new(FakeConnector::default());
            let (tx, events) = mpsc::unbounded_channel();
            let router = Arc::new(RelayRouter::new(
                test_config(),
                relay.clone(),
                connector.clone(),
                tx,
            ));
            Self {
                router,
                relay,
                connector,
                events,
            }
        }

        fn remote(&self) -> Arc<FakeRemote> {
            self.connector.remote.clone()
        }

        async fn command(&self, name: &str, args: &str) {
            self.router
                .handle_update(IncomingUpdate::Command(Command {
                    chat_id: OP.chat(),
                    user_id: UserId(OP.0),
                    name: name.to_string(),
                    args: args.to_string(),
                }))
                .await;
        }

        async fn content(&self, body: ContentBody, reply_to: Option<MessageId>) {
            self.router
                .handle_update(IncomingUpdate::Content(ContentMessage {
                    chat_id: OP.chat(),
                    user_id: UserId(OP.0),
                    reply_to,
                    body,
                }))
                .await;
        }

        async fn text(&self, text: &str, reply_to: Option<MessageId>) {
            self.content(ContentBody::Text(text.to_string()), reply_to)
                .await;
        }

        /// Feed everything the remote side emitted so far through the router.
        async fn drain(&mut self) {
            while let Ok(envelope) = self.events.try_recv() {
                self.router.handle_remote_event(envelope).await;
            }
        }

        async fn emit(&mut self, event: RemoteEvent) {
            self.connector.last_sink().emit(event);
            self.drain().await;
        }

        async fn connect_ready(&mut self) {
            self.command("scan", "").await;
            self.emit(RemoteEvent::Ready).await;
            assert_eq!(
                self.router.session_state(OP).await,
                Some(SessionState::Ready)
            );
        }

        async fn inbound(&mut self, from: &str, media: Option<RemoteMedia>) -> MessageId {
            self.emit(RemoteEvent::Message(RemoteMessage {
                from: RemoteChatId(from.to_string()),
                sender_name: Some("Alice".to_string()),
                sender_number: "15550001111".to_string(),
                group_name: None,
                body: "see attached".to_string(),
                media,
            }))
            .await;
            self.relay.sent().last().expect("relayed message").message_id
        }
    }

    fn temp_image(cfg_dir: &Path, name: &str) -> MediaPayload {
        let path = unique_media_path(cfg_dir, name);
        std::fs::write(&path, b"\x89PNG").unwrap();
        MediaPayload::new(path, "image/jpeg", name)
    }

    #[tokio::test]
    async fn scan_pair_send_scenario() {
        let mut h = Harness::new();

        h.command("scan", "").await;
        assert_eq!(h.relay.last_text(), "Generating QR code...");
        assert_eq!(h.router.session_state(OP).await, Some(SessionState::Pairing));

        h.emit(RemoteEvent::PairingChallenge {
            token: "2@abc<def>".to_string(),
            image: None,
        })
        .await;
        assert!(h.relay.last_text().contains("<code>2@abc&lt;def&gt;</code>"));

        h.emit(RemoteEvent::Ready).await;
        assert_eq!(h.router.session_state(OP).await, Some(SessionState::Ready));
        assert_eq!(h.relay.last_text(), READY_NOTICE);

        h.command("send", "+15551234567").await;
        match h.router.pending_state(OP).await {
            PendingSend::AwaitingContent { target } => assert_eq!(target.digits(), "15551234567"),
            other => panic!("expected AwaitingContent, got {other:?}"),
        }

        h.text("hello", None).await;
        let sent = h.remote().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, RemoteChatId("15551234567@c.us".to_string()));
        assert_eq!(sent[0].text, "hello");
        assert_eq!(h.router.pending_state(OP).await, PendingSend::Idle);

        let texts = h.relay.texts();
        assert!(texts.contains(&"Sending your message to +15551234567...".to_string()));
        assert_eq!(h.relay.last_text(), "✅ Message sent to +15551234567");
    }

    #[tokio::test]
    async fn pairing_qr_image_falls_back_to_document_then_text() {
        let mut h = Harness::new();
        h.command("scan", "").await;

        let qr = unique_media_path(&h.router.cfg.temp_dir, "qr.png");
        std::fs::write(&qr, b"\x89PNG").unwrap();
        h.emit(RemoteEvent::PairingChallenge {
            token: "t".to_string(),
            image: Some(qr.clone()),
        })
        .await;
        let last = h.relay.sent().last().cloned().unwrap();
        assert_eq!(last.kind, "image");
        assert_eq!(last.text, QR_CAPTION);
        assert!(!qr.exists(), "delivered QR image should be cleaned up");

        h.relay.fail_images.store(true, Ordering::SeqCst);
        h.emit(RemoteEvent::PairingChallenge {
            token: "t".to_string(),
            image: Some(qr.clone()),
        })
        .await;
        assert_eq!(h.relay.sent().last().unwrap().kind, "document");

        h.relay.fail_documents.store(true, Ordering::SeqCst);
        h.emit(RemoteEvent::PairingChallenge {
            token: "t".to_string(),
            image: Some(qr),
        })
        .await;
        assert_eq!(h.relay.last_text(), "Failed to send QR. Check logs.");
    }

    #[tokio::test]
    async fn second_open_is_already_connected() {
        let mut h = Harness::new();
        h.command("scan", "").await;
        h.command("scan", "").await;
        assert_eq!(
            h.relay.last_text(),
            "You are already connected. Use /logout to disconnect first."
        );

        h.emit(RemoteEvent::Ready).await;
        let err = h.router.open_session(OP).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Relay(RelayError::AlreadyConnected)
        ));
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn close_without_session_is_not_connected() {
        let h = Harness::new();
        h.command("logout", "").await;
        assert_eq!(h.relay.last_text(), "You are not connected.");

        let err = h.router.close_session(OP).await.unwrap_err();
        assert!(matches!(err, crate::Error::Relay(RelayError::NotConnected)));
        assert_eq!(h.router.session_state(OP).await, None);
    }

    #[tokio::test]
    async fn logout_removes_session_even_when_logout_fails() {
        let mut h = Harness::new();
        h.connect_ready().await;
        h.command("logout", "").await;
        assert_eq!(h.relay.last_text(), "Logged out from WhatsApp.");
        assert_eq!(h.router.session_state(OP).await, None);
        assert!(h.connector.purged().is_empty());

        h.connect_ready().await;
        h.remote().fail_logout.store(true, Ordering::SeqCst);
        assert_eq!(
            h.router.close_session(OP).await.unwrap(),
            CloseOutcome::LogoutFailed("external error: browser closed".to_string())
        );
        assert_eq!(h.router.session_state(OP).await, None);
        assert_eq!(h.connector.purged(), vec![OP]);
        assert_eq!(h.remote().logouts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn logout_leaves_pending_send_alone() {
        let mut h = Harness::new();
        h.connect_ready().await;
        h.command("send", "12345678901").await;
        h.command("logout", "").await;
        assert!(matches!(
            h.router.pending_state(OP).await,
            PendingSend::AwaitingContent { .. }
        ));
    }

    #[tokio::test]
    async fn send_requires_ready_session_and_valid_target() {
        let mut h = Harness::new();
        h.command("send", "+15551234567").await;
        assert_eq!(h.relay.last_text(), "You must connect first with /scan.");

        h.command("scan", "").await;
        h.command("send", "+15551234567").await;
        assert_eq!(h.relay.last_text(), "You must connect first with /scan.");

        h.emit(RemoteEvent::Ready).await;
        h.command("send", "abc").await;
        assert_eq!(
            h.relay.last_text(),
            "Invalid number format. Use e.g. /send +1234567890"
        );
        assert_eq!(h.router.pending_state(OP).await, PendingSend::Idle);

        let target = h.router.request_send(OP, "12345678901").await.unwrap();
        assert_eq!(target.digits(), "12345678901");
    }

    #[tokio::test]
    async fn failed_delivery_still_consumes_pending_send() {
        let mut h = Harness::new();
        h.connect_ready().await;
        h.remote().fail_sends.store(true, Ordering::SeqCst);

        h.command("send", "+15551234567").await;
        h.text("hello", None).await;

        assert_eq!(h.router.pending_state(OP).await, PendingSend::Idle);
        assert_eq!(
            h.relay.last_text(),
            "❌ Failed to send message to +15551234567. Check logs."
        );

        let err = send_outbound(
            h.remote().as_ref(),
            &RemoteChatId("15551234567@c.us".to_string()),
            &Outbound::Text("hello".to_string()),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Relay(RelayError::DeliveryFailed(ref reason)) if reason.contains("chat not found")
        ));

        // Not retried: the next text is not part of any flow.
        h.remote().fail_sends.store(false, Ordering::SeqCst);
        h.text("hello again", None).await;
        assert!(h.remote().sent().is_empty());
    }

    #[tokio::test]
    async fn cancel_reports_nothing_pending_or_clears() {
        let mut h = Harness::new();
        h.connect_ready().await;

        h.command("cancel", "").await;
        assert_eq!(h.relay.last_text(), "Nothing to cancel.");

        h.command("send", "+15551234567").await;
        h.command("cancel", "").await;
        assert_eq!(h.relay.last_text(), "Operation cancelled.");
        assert_eq!(h.router.pending_state(OP).await, PendingSend::Idle);

        let err = h.router.cancel_send(OP).await.unwrap_err();
        assert!(matches!(err, crate::Error::Relay(RelayError::NothingPending)));
    }

    #[tokio::test]
    async fn inbound_image_is_correlated_and_reply_routes_back() {
        let mut h = Harness::new();
        h.connect_ready().await;
        let payload = temp_image(&h.router.cfg.temp_dir, "photo.jpg");
        let path = payload.path.clone();

        let relayed = h
            .inbound(
                "X@c.us",
                Some(RemoteMedia {
                    payload: Some(payload),
                }),
            )
            .await;

        let last = h.relay.sent().last().cloned().unwrap();
        assert_eq!(last.kind, "image");
        assert_eq!(last.chat, OP.chat());
        assert!(last
            .text
            .starts_with("<b>New message from Alice (+15550001111):</b>\n\nsee attached"));
        assert_eq!(
            h.router.resolve(OP, relayed).await,
            Some(RemoteChatId("X@c.us".to_string()))
        );
        assert!(!path.exists(), "inbound media should be cleaned up");

        h.text("ok", Some(relayed)).await;
        let sent = h.remote().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, RemoteChatId("X@c.us".to_string()));
        assert_eq!(sent[0].text, "ok");
        assert_eq!(h.relay.last_text(), "✅ Reply sent to WhatsApp!");
    }

    #[tokio::test]
    async fn rejected_image_falls_back_to_document() {
        let mut h = Harness::new();
        h.connect_ready().await;
        h.relay.fail_images.store(true, Ordering::SeqCst);
        let payload = temp_image(&h.router.cfg.temp_dir, "photo.jpg");

        let relayed = h
            .inbound(
                "X@c.us",
                Some(RemoteMedia {
                    payload: Some(payload),
                }),
            )
            .await;

        let last = h.relay.sent().last().cloned().unwrap();
        assert_eq!(last.kind, "document");
        assert_eq!(last.file_name.as_deref(), Some("file.jpg"));
        assert_eq!(
            h.router.resolve(OP, relayed).await,
            Some(RemoteChatId("X@c.us".to_string()))
        );
    }

    #[tokio::test]
    async fn non_image_media_goes_out_as_document() {
        let mut h = Harness::new();
        h.connect_ready().await;
        let path = unique_media_path(&h.router.cfg.temp_dir, "doc.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        h.inbound(
            "X@c.us",
            Some(RemoteMedia {
                payload: Some(MediaPayload::new(path, "application/pdf", "media.pdf")),
            }),
        )
        .await;

        let last = h.relay.sent().last().cloned().unwrap();
        assert_eq!(last.kind, "document");
        assert_eq!(last.file_name.as_deref(), Some("media.pdf"));
    }

    #[tokio::test]
    async fn total_inbound_failure_is_dropped_without_correlation() {
        let mut h = Harness::new();
        h.connect_ready().await;
        h.relay.fail_images.store(true, Ordering::SeqCst);
        h.relay.fail_documents.store(true, Ordering::SeqCst);
        let before = h.relay.sent().len();
        let payload = temp_image(&h.router.cfg.temp_dir, "photo.jpg");

        h.emit(RemoteEvent::Message(RemoteMessage {
            from: RemoteChatId("X@c.us".to_string()),
            sender_name: None,
            sender_number: "15550001111".to_string(),
            group_name: None,
            body: String::new(),
            media: Some(RemoteMedia {
                payload: Some(payload),
            }),
        }))
        .await;

        assert_eq!(h.relay.sent().len(), before);
        {
            let st = h.router.state.lock().await;
            assert!(st.registry.get(OP).unwrap().correlations().is_empty());
        }

        let err = h
            .router
            .relay_media(OP, &MediaPayload::new("/tmp/none.jpg", "image/jpeg", "a.jpg"), "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Relay(RelayError::DeliveryFailed(_))
        ));
    }

    #[tokio::test]
    async fn media_without_payload_is_dropped() {
        let mut h = Harness::new();
        h.connect_ready().await;
        let before = h.relay.sent().len();

        h.emit(RemoteEvent::Message(RemoteMessage {
            from: RemoteChatId("X@c.us".to_string()),
            sender_name: None,
            sender_number: "15550001111".to_string(),
            group_name: None,
            body: String::new(),
            media: Some(RemoteMedia { payload: None }),
        }))
        .await;

        assert_eq!(h.relay.sent().len(), before);
    }

    #[tokio::test]
    async fn group_text_header_names_sender_and_group() {
        let mut h = Harness::new();
        h.connect_ready().await;

        h.emit(RemoteEvent::Message(RemoteMessage {
            from: RemoteChatId("123-456@g.us".to_string()),
            sender_name: None,
            sender_number: "15550001111".to_string(),
            group_name: Some("Family & Friends".to_string()),
            body: "dinner <8pm>?".to_string(),
            media: None,
        }))
        .await;

        assert_eq!(
            h.relay.last_text(),
            "<b>New message from +15550001111 (+15550001111) in group &quot;Family &amp; Friends&quot;:</b>\n\ndinner &lt;8pm&gt;?"
        );
        let id = h.relay.sent().last().unwrap().message_id;
        assert_eq!(
            h.router.resolve(OP, id).await,
            Some(RemoteChatId("123-456@g.us".to_string()))
        );
    }

    #[tokio::test]
    async fn long_captions_are_cut_to_the_caption_limit() {
        let mut h = Harness::new();
        h.connect_ready().await;
        let payload = temp_image(&h.router.cfg.temp_dir, "photo.jpg");

        h.emit(RemoteEvent::Message(RemoteMessage {
            from: RemoteChatId("X@c.us".to_string()),
            sender_name: Some("Alice".to_string()),
            sender_number: "15550001111".to_string(),
            group_name: None,
            body: "x".repeat(5000),
            media: Some(RemoteMedia {
                payload: Some(payload),
            }),
        }))
        .await;

        let caption = h.relay.sent().last().unwrap().text.clone();
        let plain = caption.replace("<b>", "").replace("</b>", "");
        assert!(plain.chars().count() <= 1024, "{}", plain.chars().count());
        assert!(plain.ends_with("..."));
    }

    #[tokio::test]
    async fn remote_disconnect_tears_down_session() {
        let mut h = Harness::new();
        h.connect_ready().await;
        let relayed = h.inbound("X@c.us", None).await;

        h.emit(RemoteEvent::Disconnected {
            reason: "LOGOUT".to_string(),
        })
        .await;

        assert_eq!(h.router.session_state(OP).await, None);
        assert_eq!(h.router.resolve(OP, relayed).await, None);
        assert_eq!(h.connector.purged(), vec![OP]);
        assert_eq!(h.relay.last_text(), DISCONNECTED_NOTICE);

        h.command("send", "+15551234567").await;
        assert_eq!(h.relay.last_text(), "You must connect first with /scan.");
    }

    #[tokio::test]
    async fn init_failure_while_pairing_reports_pairing_failed() {
        let mut h = Harness::new();
        h.command("scan", "").await;
        h.emit(RemoteEvent::InitFailed {
            reason: "auth failure".to_string(),
        })
        .await;

        assert_eq!(h.router.session_state(OP).await, None);
        assert_eq!(h.relay.last_text(), INIT_FAILED_NOTICE);

        // A fresh scan is allowed afterwards.
        h.command("scan", "").await;
        assert_eq!(h.router.session_state(OP).await, Some(SessionState::Pairing));
    }

    #[tokio::test]
    async fn connector_failure_surfaces_pairing_failed() {
        let h = Harness::new();
        h.connector.fail_connect.store(true, Ordering::SeqCst);

        let err = h.router.open_session(OP).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Relay(RelayError::PairingFailed(_))
        ));
        assert_eq!(h.router.session_state(OP).await, None);

        h.command("scan", "").await;
        assert_eq!(h.relay.last_text(), INIT_FAILED_NOTICE);
    }

    #[tokio::test]
    async fn events_from_a_previous_session_are_ignored() {
        let mut h = Harness::new();
        h.command("scan", "").await;
        let old_sink = h.connector.last_sink();
        h.command("logout", "").await;
        h.command("scan", "").await;

        old_sink.emit(RemoteEvent::Disconnected {
            reason: "LOGOUT".to_string(),
        });
        old_sink.emit(RemoteEvent::Ready);
        h.drain().await;

        assert_eq!(h.router.session_state(OP).await, Some(SessionState::Pairing));
    }

    #[tokio::test]
    async fn unrelated_content_is_a_no_op() {
        let mut h = Harness::new();
        h.text("before connecting", None).await;
        assert!(h.relay.sent().is_empty());

        h.connect_ready().await;
        let before = h.relay.sent().len();
        h.text("plain", None).await;
        h.text("reply to something unknown", Some(MessageId(999))).await;
        assert!(h.remote().sent().is_empty());
        assert_eq!(h.relay.sent().len(), before);
    }

    #[tokio::test]
    async fn pending_send_takes_precedence_over_reply() {
        let mut h = Harness::new();
        h.connect_ready().await;
        let relayed = h.inbound("X@c.us", None).await;

        h.command("send", "+15551234567").await;
        h.text("hi", Some(relayed)).await;

        let sent = h.remote().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, RemoteChatId("15551234567@c.us".to_string()));

        // With the pending send consumed, the same reply now routes to X.
        h.text("hi again", Some(relayed)).await;
        assert_eq!(
            h.remote().sent()[1].to,
            RemoteChatId("X@c.us".to_string())
        );
    }

    #[tokio::test]
    async fn photo_and_document_are_downloaded_and_forwarded() {
        let mut h = Harness::new();
        h.connect_ready().await;

        h.command("send", "+15551234567").await;
        h.content(
            ContentBody::Photo {
                file_id: "photo-1".to_string(),
                caption: Some("look".to_string()),
            },
            None,
        )
        .await;
        assert_eq!(h.relay.last_text(), "✅ Image sent to +15551234567");

        let relayed = h.inbound("X@c.us", None).await;
        h.content(
            ContentBody::Document {
                file_id: "doc-1".to_string(),
                file_name: Some("report.pdf".to_string()),
                mime_type: None,
                caption: None,
            },
            Some(relayed),
        )
        .await;
        assert_eq!(h.relay.last_text(), "✅ Document reply sent to WhatsApp!");

        assert_eq!(
            *h.relay.downloads.lock().unwrap(),
            vec!["photo-1".to_string(), "doc-1".to_string()]
        );

        let sent = h.remote().sent();
        let photo = sent[0].media.clone().unwrap();
        assert_eq!(photo.mime_type, "image/jpeg");
        assert_eq!(photo.file_name, "image.jpg");
        assert_eq!(sent[0].text, "look");
        assert!(sent[0].media_existed);
        assert!(!photo.path.exists(), "downloaded media should be cleaned up");

        let doc = sent[1].media.clone().unwrap();
        assert_eq!(doc.mime_type, DEFAULT_MIME);
        assert_eq!(doc.file_name, "report.pdf");
        assert_eq!(sent[1].to, RemoteChatId("X@c.us".to_string()));
    }

    #[tokio::test]
    async fn documents_are_reported_as_documents_whatever_their_mime() {
        let mut h = Harness::new();
        h.connect_ready().await;
        let png_doc = || ContentBody::Document {
            file_id: "doc-png".to_string(),
            file_name: Some("scan.png".to_string()),
            mime_type: Some("image/png".to_string()),
            caption: None,
        };

        h.command("send", "15551234567").await;
        assert_eq!(
            h.relay.last_text(),
            "Send the message (text or image) you want to deliver to 15551234567. Use /cancel to abort."
        );
        h.content(png_doc(), None).await;
        assert_eq!(h.relay.last_text(), "✅ Document sent to 15551234567");

        let relayed = h.inbound("X@c.us", None).await;
        h.content(png_doc(), Some(relayed)).await;
        assert_eq!(h.relay.last_text(), "✅ Document reply sent to WhatsApp!");

        let sent = h.remote().sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].media.as_ref().unwrap().mime_type, "image/png");
    }

    #[tokio::test]
    async fn unsupported_content_consumes_pending_send() {
        let mut h = Harness::new();
        h.connect_ready().await;
        h.command("send", "+15551234567").await;

        h.content(
            ContentBody::Unsupported {
                kind: "sticker".to_string(),
            },
            None,
        )
        .await;

        assert_eq!(
            h.relay.last_text(),
            "Unsupported message type for /send. Use text, photo or document."
        );
        assert_eq!(h.router.pending_state(OP).await, PendingSend::Idle);
        assert!(h.remote().sent().is_empty());
    }

    #[tokio::test]
    async fn start_help_and_unknown_commands() {
        let h = Harness::new();
        h.command("start", "").await;
        assert_eq!(h.relay.last_text(), WELCOME_TEXT);
        h.command("help", "").await;
        assert_eq!(h.relay.last_text(), HELP_TEXT);

        let before = h.relay.sent().len();
        h.command("stats", "").await;
        assert_eq!(h.relay.sent().len(), before);
    }

    #[tokio::test]
    async fn event_pump_keeps_per_operator_order() {
        let mut h = Harness::new();
        h.command("scan", "").await;
        let (_, placeholder) = mpsc::unbounded_channel();
        let events = std::mem::replace(&mut h.events, placeholder);
        tokio::spawn(h.router.clone().run_event_pump(events));

        let sink = h.connector.last_sink();
        sink.emit(RemoteEvent::Ready);
        sink.emit(RemoteEvent::Message(RemoteMessage {
            from: RemoteChatId("X@c.us".to_string()),
            sender_name: Some("Bob".to_string()),
            sender_number: "15550002222".to_string(),
            group_name: None,
            body: "hi".to_string(),
            media: None,
        }));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !h.relay.last_text().contains("New message from Bob") {
            assert!(tokio::time::Instant::now() < deadline, "pump did not deliver");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let texts = h.relay.texts();
        let ready = texts.iter().position(|t| t == READY_NOTICE).unwrap();
        let msg = texts
            .iter()
            .position(|t| t.contains("New message from Bob"))
            .unwrap();
        assert!(ready < msg);
    }
}
