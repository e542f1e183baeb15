//! Per-conversation chat state.
//!
//! A [`ChatSession`] owns the message list of one conversation and publishes
//! it as a [`SessionSnapshot`] on a `watch` channel. Sends are optimistic:
//! the message is shown immediately as `sending`, then pushed down both the
//! realtime socket and the durable API. Anything that cannot be confirmed
//! is handed to the shared [`OfflineMessageQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_net::{ChatApi, ConnectivityMonitor, PresenceTracker, RealtimeChannel, SendMessageRequest};
use courier_shared::{
    ClientEvent, ConversationId, DeliveryStatus, Message, MessageId, MessageKind,
    OutgoingMessage, QueuedMessage, ServerEvent, UserId,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{SendError, SessionError};
use crate::queue::OfflineMessageQueue;
use crate::reconciler;
use crate::snapshot::SessionSnapshot;
use crate::transport::SendHandler;
use crate::typing::TypingTracker;

/// Collaborators every session of one client shares.
#[derive(Clone)]
pub struct SessionContext {
    pub user_id: UserId,
    pub api: Arc<dyn ChatApi>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub connectivity: ConnectivityMonitor,
    pub queue: OfflineMessageQueue,
    pub typing_idle: Duration,
}

#[derive(Clone)]
pub struct ChatSession {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    conversation_id: ConversationId,
    ctx: SessionContext,
    state: watch::Sender<SessionSnapshot>,
    ephemeral: Mutex<Ephemeral>,
    sending: AtomicBool,
}

/// State that feeds the snapshot but is not part of it.
struct Ephemeral {
    typing: TypingTracker,
    presence: PresenceTracker,
    /// Messages deleted locally while a send of them was still in flight.
    discarded: Vec<Discarded>,
}

struct Discarded {
    local_id: MessageId,
    correlation_id: Option<String>,
    /// Set once the confirmed server copy has been deleted.
    server_id: Option<MessageId>,
}

impl Discarded {
    fn matches(&self, local_id: Option<&MessageId>, message: &Message) -> bool {
        local_id == Some(&self.local_id)
            || self.server_id.as_ref() == Some(&message.id)
            || (message.correlation_id.is_some()
                && message.correlation_id == self.correlation_id)
    }
}

/// Deleted in-flight messages remembered per session.
const DISCARDED_LIMIT: usize = 64;

/// Clears the single-flight flag however `send` exits.
struct InFlight<'a>(&'a ChatSession);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.inner.sending.store(false, Ordering::SeqCst);
        self.0
            .update(|s| std::mem::replace(&mut s.is_sending, false));
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

impl ChatSession {
    pub fn new(conversation_id: ConversationId, ctx: SessionContext) -> Self {
        let initial = SessionSnapshot {
            is_online: ctx.connectivity.is_connected(),
            ..SessionSnapshot::default()
        };
        let (state, _rx) = watch::channel(initial);
        let ephemeral = Ephemeral {
            typing: TypingTracker::new(ctx.typing_idle),
            presence: PresenceTracker::new(),
            discarded: Vec::new(),
        };

        Self {
            inner: Arc::new(SessionInner {
                conversation_id,
                ctx,
                state,
                ephemeral: Mutex::new(ephemeral),
                sending: AtomicBool::new(false),
            }),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.ctx.user_id
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub(crate) fn api(&self) -> &dyn ChatApi {
        self.inner.ctx.api.as_ref()
    }

    pub(crate) fn queue(&self) -> &OfflineMessageQueue {
        &self.inner.ctx.queue
    }

    /// Mutate the snapshot; subscribers are woken only if `f` returns true.
    pub(crate) fn update(&self, f: impl FnOnce(&mut SessionSnapshot) -> bool) -> bool {
        self.inner.state.send_if_modified(f)
    }

    fn ephemeral(&self) -> MutexGuard<'_, Ephemeral> {
        self.inner
            .ephemeral
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_online(&self) -> bool {
        self.inner.ctx.connectivity.is_connected() && self.inner.ctx.realtime.is_connected()
    }

    pub fn set_online(&self, online: bool) {
        self.update(|s| replace_if_changed(&mut s.is_online, online));
    }

    pub(crate) fn find_message(&self, id: &MessageId) -> Option<Message> {
        self.inner.state.borrow().message(id).cloned()
    }

    /// Move a locally created message to `status`, wherever reconciliation
    /// has put it.
    pub(crate) fn mark_local(
        &self,
        local_id: &MessageId,
        correlation_id: Option<&str>,
        status: DeliveryStatus,
    ) -> bool {
        self.update(|s| {
            match reconciler::position_of_local(&s.messages, local_id, correlation_id) {
                Some(index) => reconciler::set_status(&mut s.messages, index, status),
                None => false,
            }
        })
    }

    pub(crate) fn fail_local(
        &self,
        local_id: &MessageId,
        correlation_id: Option<&str>,
        error: String,
    ) {
        self.mark_local(local_id, correlation_id, DeliveryStatus::Failed);
        self.update(|s| replace_if_changed(&mut s.error, Some(error)));
    }

    fn reconcile_sent(&self, confirmed: Message, local_id: Option<&MessageId>) {
        let id = confirmed.id.clone();
        if self.update(|s| reconciler::confirm_sent(&mut s.messages, confirmed, local_id)) {
            debug!(conversation = %self.conversation_id(), message = %id, "Message confirmed");
        }
    }

    /// Remember a locally deleted message whose send may still complete.
    pub(crate) fn discard_on_confirm(&self, local_id: &MessageId, correlation_id: Option<&str>) {
        let mut ephemeral = self.ephemeral();
        if ephemeral.discarded.len() >= DISCARDED_LIMIT {
            ephemeral.discarded.remove(0);
        }
        ephemeral.discarded.push(Discarded {
            local_id: local_id.clone(),
            correlation_id: correlation_id.map(str::to_string),
            server_id: None,
        });
    }

    /// Forget a discarded message. Returns whether it was remembered.
    pub(crate) fn take_discarded(&self, local_id: &MessageId) -> bool {
        let mut ephemeral = self.ephemeral();
        let before = ephemeral.discarded.len();
        ephemeral.discarded.retain(|d| &d.local_id != local_id);
        ephemeral.discarded.len() != before
    }

    fn is_discarded(&self, local_id: Option<&MessageId>, message: &Message) -> bool {
        self.ephemeral()
            .discarded
            .iter()
            .any(|d| d.matches(local_id, message))
    }

    /// Fold the API's confirmation of a message this session sent into the
    /// list. A message the user deleted meanwhile is deleted on the server
    /// instead, once.
    pub(crate) async fn accept_confirmation(&self, confirmed: Message, local_id: Option<&MessageId>) {
        let first_confirmation = {
            let mut ephemeral = self.ephemeral();
            ephemeral
                .discarded
                .iter_mut()
                .find(|d| d.matches(local_id, &confirmed))
                .map(|d| d.server_id.replace(confirmed.id.clone()).is_none())
        };

        match first_confirmation {
            None => {
                self.reconcile_sent(confirmed, local_id);
                return;
            }
            Some(false) => {
                debug!(
                    conversation = %self.conversation_id(),
                    message = %confirmed.id,
                    "Deleted message already removed from server"
                );
                return;
            }
            Some(true) => {}
        }

        info!(
            conversation = %self.conversation_id(),
            message = %confirmed.id,
            "Deleted message was delivered, removing server copy"
        );
        if let Err(e) = self.api().delete_message(self.conversation_id(), &confirmed.id).await {
            error!(
                conversation = %self.conversation_id(),
                message = %confirmed.id,
                error = %e,
                "Could not delete server copy of deleted message"
            );
            let reason = e.to_string();
            self.update(|s| replace_if_changed(&mut s.error, Some(reason)));
        }
    }

    /// A queued copy of one of this session's messages ran out of automatic
    /// retries: show the message as failed so it can be retried by hand.
    pub(crate) fn on_queue_exhausted(&self, item: &QueuedMessage) {
        let Some(local_id) = item.local_message_id.as_ref() else {
            return;
        };
        let failed = self.update(|s| {
            match reconciler::position_of_local(&s.messages, local_id, item.correlation_id.as_deref()) {
                Some(index) => reconciler::fail_unconfirmed(&mut s.messages, index),
                None => false,
            }
        });
        if failed {
            warn!(
                conversation = %self.conversation_id(),
                message = %local_id,
                retry_count = item.retry_count,
                "Queued message gave up, waiting for manual retry"
            );
            let reason = format!("Message not delivered after {} attempts", item.retry_count);
            self.update(|s| replace_if_changed(&mut s.error, Some(reason)));
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a text message. See [`ChatSession::send_message`].
    pub async fn send(
        &self,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Option<MessageId>, SessionError> {
        self.send_message(content, MessageKind::Text, reply_to).await
    }

    /// Optimistically append a message and deliver it.
    ///
    /// Returns `Ok(None)` without doing anything for blank content or while
    /// another send of this session is in flight. Otherwise returns the id
    /// the message carries once this call finishes (the server id if it was
    /// confirmed, the temporary id if it was queued).
    pub async fn send_message(
        &self,
        content: &str,
        kind: MessageKind,
        reply_to: Option<MessageId>,
    ) -> Result<Option<MessageId>, SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        if self
            .inner
            .sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(conversation = %self.conversation_id(), "Send already in flight, ignoring");
            return Ok(None);
        }
        let _in_flight = InFlight(self);

        let conversation_id = self.conversation_id().clone();
        let optimistic = Message::optimistic(
            conversation_id.clone(),
            self.user_id().clone(),
            content,
            kind,
            reply_to.clone(),
        );
        let local_id = optimistic.id.clone();
        let correlation_id = optimistic.correlation_id.clone();

        self.update(|s| {
            s.messages.push(optimistic);
            s.is_sending = true;
            s.error = None;
            true
        });
        debug!(conversation = %conversation_id, message = %local_id, "Sending message");

        if self.is_online() {
            let socket_accepted = self.inner.ctx.realtime.emit(ClientEvent::SendMessage {
                conversation_id: conversation_id.clone(),
                content: content.to_string(),
                kind,
                reply_to: reply_to.clone(),
                correlation_id: correlation_id.clone(),
            });
            if let Err(e) = &socket_accepted {
                debug!(conversation = %conversation_id, error = %e, "Realtime send failed");
            }

            let request = SendMessageRequest {
                content: content.to_string(),
                kind,
                reply_to: reply_to.clone(),
                correlation_id: correlation_id.clone(),
                attachments: Vec::new(),
            };

            match self.api().send_message(&conversation_id, &request).await {
                Ok(confirmed) => {
                    let server_id = confirmed.id.clone();
                    self.accept_confirmation(confirmed, Some(&local_id)).await;
                    return Ok(Some(server_id));
                }
                Err(e) if socket_accepted.is_ok() => {
                    warn!(
                        conversation = %conversation_id,
                        message = %local_id,
                        error = %e,
                        "API send failed, realtime path accepted the message"
                    );
                    self.mark_local(&local_id, correlation_id.as_deref(), DeliveryStatus::Sent);
                    return Ok(Some(local_id));
                }
                Err(e) if !e.is_transient() => {
                    error!(
                        conversation = %conversation_id,
                        message = %local_id,
                        error = %e,
                        "Message rejected"
                    );
                    self.fail_local(&local_id, correlation_id.as_deref(), e.to_string());
                    return Err(SessionError::Rejected(e));
                }
                Err(e) => {
                    warn!(
                        conversation = %conversation_id,
                        message = %local_id,
                        error = %e,
                        "Send failed on both paths, queueing"
                    );
                }
            }
        }

        let outgoing = OutgoingMessage {
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            kind,
            reply_to,
            attachments: Vec::new(),
            local_message_id: Some(local_id.clone()),
            correlation_id: correlation_id.clone(),
        };

        match self.queue().enqueue(outgoing).await {
            Ok(queue_id) => {
                info!(
                    conversation = %conversation_id,
                    message = %local_id,
                    queue_id = %queue_id,
                    "Message queued for delivery"
                );
                self.mark_local(&local_id, correlation_id.as_deref(), DeliveryStatus::Sent);
                Ok(Some(local_id))
            }
            Err(e) => {
                error!(
                    conversation = %conversation_id,
                    message = %local_id,
                    error = %e,
                    "Could not queue message"
                );
                self.fail_local(&local_id, correlation_id.as_deref(), e.to_string());
                Err(SessionError::Queue(e))
            }
        }
    }

    /// The delegate this session attaches to the transport while it owns it.
    pub fn send_handler(&self) -> Arc<dyn SendHandler> {
        Arc::new(SessionSendHandler {
            session: Arc::downgrade(&self.inner),
        })
    }

    // -----------------------------------------------------------------------
    // Best-effort signals
    // -----------------------------------------------------------------------

    /// Mark every peer message read locally and tell the server. Never fails.
    pub fn mark_read(&self) {
        let user = self.user_id().clone();
        let now = Utc::now();
        let mut marked = 0;
        self.update(|s| {
            marked = reconciler::mark_peer_messages_read(&mut s.messages, &user, now);
            marked > 0
        });
        debug!(conversation = %self.conversation_id(), marked, "Marked conversation read");

        let event = ClientEvent::MarkRead {
            conversation_id: self.conversation_id().clone(),
        };
        if let Err(e) = self.inner.ctx.realtime.emit(event) {
            debug!(conversation = %self.conversation_id(), error = %e, "mark_read not delivered");
        }
    }

    pub fn set_typing(&self, is_typing: bool) {
        let event = ClientEvent::Typing {
            conversation_id: self.conversation_id().clone(),
            is_typing,
        };
        if let Err(e) = self.inner.ctx.realtime.emit(event) {
            debug!(conversation = %self.conversation_id(), error = %e, "Typing signal not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Fetch history from the API and merge it.
    pub async fn load(&self) -> Result<(), SessionError> {
        self.update(|s| replace_if_changed(&mut s.is_loading, true));

        match self.api().get_messages(self.conversation_id()).await {
            Ok(history) => {
                let count = history.len();
                self.update(|s| {
                    reconciler::merge_history(&mut s.messages, history);
                    s.is_loading = false;
                    s.error = None;
                    true
                });
                debug!(conversation = %self.conversation_id(), count, "History loaded");
                Ok(())
            }
            Err(e) => {
                warn!(conversation = %self.conversation_id(), error = %e, "Failed to load history");
                let message = e.to_string();
                self.update(|s| {
                    s.is_loading = false;
                    s.error = Some(message);
                    true
                });
                Err(e.into())
            }
        }
    }

    /// Apply one realtime event. Must run inside a tokio runtime (typing
    /// indicators arm a timer).
    pub fn handle_event(&self, event: ServerEvent) {
        if event.conversation_id() != self.conversation_id() {
            debug!(
                conversation = %self.conversation_id(),
                other = %event.conversation_id(),
                "Ignoring event for another conversation"
            );
            return;
        }

        match event {
            ServerEvent::NewMessage(message)
                if self.is_discarded(None, &message) =>
            {
                debug!(
                    conversation = %self.conversation_id(),
                    message = %message.id,
                    "Ignoring echo of deleted message"
                );
            }

            ServerEvent::MessageSent { message, temp_id }
                if self.is_discarded(temp_id.as_ref(), &message) =>
            {
                debug!(
                    conversation = %self.conversation_id(),
                    message = %message.id,
                    "Ignoring confirmation of deleted message"
                );
            }

            ServerEvent::NewMessage(message) => {
                let id = message.id.clone();
                if self.update(|s| reconciler::upsert_message(&mut s.messages, message)) {
                    debug!(conversation = %self.conversation_id(), message = %id, "Merged new message");
                }
            }

            ServerEvent::MessageSent { message, temp_id } => {
                self.reconcile_sent(message, temp_id.as_ref());
            }

            ServerEvent::MessageDelivered { message_ids, .. } => {
                self.update(|s| reconciler::apply_delivered(&mut s.messages, &message_ids) > 0);
            }

            ServerEvent::MessagesRead {
                reader_id,
                message_ids,
                read_at,
                ..
            } => {
                let user = self.user_id().clone();
                let read_at = read_at.unwrap_or_else(Utc::now);
                self.update(|s| {
                    reconciler::apply_read(
                        &mut s.messages,
                        &reader_id,
                        message_ids.as_deref(),
                        &user,
                        read_at,
                    ) > 0
                });
            }

            ServerEvent::UserTyping {
                user_id, is_typing, ..
            } => self.on_typing(user_id, is_typing),

            presence @ (ServerEvent::UserOnline { .. } | ServerEvent::UserOffline { .. }) => {
                let users = {
                    let mut ephemeral = self.ephemeral();
                    ephemeral.presence.apply(&presence);
                    ephemeral.presence.online_users()
                };
                self.update(|s| replace_if_changed(&mut s.online_users, users));
            }
        }
    }

    fn on_typing(&self, user: UserId, is_typing: bool) {
        if &user == self.user_id() {
            return;
        }

        if !is_typing {
            let users = {
                let mut ephemeral = self.ephemeral();
                if !ephemeral.typing.stop(&user) {
                    return;
                }
                ephemeral.typing.users()
            };
            self.update(|s| replace_if_changed(&mut s.typing_users, users));
            return;
        }

        let (generation, idle, users) = {
            let mut ephemeral = self.ephemeral();
            let generation = ephemeral.typing.start(user.clone());
            (generation, ephemeral.typing.idle(), ephemeral.typing.users())
        };
        self.update(|s| replace_if_changed(&mut s.typing_users, users));

        let session = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(inner) = session.upgrade() {
                ChatSession { inner }.expire_typing(&user, generation);
            }
        });
    }

    fn expire_typing(&self, user: &UserId, generation: u64) {
        let users = {
            let mut ephemeral = self.ephemeral();
            if !ephemeral.typing.expire(user, generation) {
                return;
            }
            ephemeral.typing.users()
        };
        debug!(conversation = %self.conversation_id(), user = %user, "Typing indicator expired");
        self.update(|s| replace_if_changed(&mut s.typing_users, users));
    }
}

/// Transmits queued messages through the API and folds confirmations for
/// its own conversation back into the session.
struct SessionSendHandler {
    session: Weak<SessionInner>,
}

#[async_trait]
impl SendHandler for SessionSendHandler {
    async fn send(&self, item: &QueuedMessage) -> Result<(), SendError> {
        let inner = self.session.upgrade().ok_or(SendError::Detached)?;
        let session = ChatSession { inner };

        let request = SendMessageRequest {
            content: item.content.clone(),
            kind: item.kind,
            reply_to: item.reply_to.clone(),
            correlation_id: item.correlation_id.clone(),
            attachments: item.attachments.clone(),
        };
        let confirmed = session
            .api()
            .send_message(&item.conversation_id, &request)
            .await?;

        if &item.conversation_id == session.conversation_id() {
            session
                .accept_confirmation(confirmed, item.local_message_id.as_ref())
                .await;
        } else {
            debug!(
                owner = %session.conversation_id(),
                conversation = %item.conversation_id,
                "Delivered queued message for another conversation"
            );
        }
        Ok(())
    }
}
