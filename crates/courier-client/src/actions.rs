//! User-initiated corrections: retrying a failed message and deleting one.

use courier_net::SendMessageRequest;
use courier_shared::{DeliveryStatus, MessageId, QueueStatus, QueuedMessage};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::reconciler;
use crate::session::ChatSession;

impl ChatSession {
    /// Resend a message that ended up `failed`.
    ///
    /// A message whose queued copy gave up is sent again through the queue.
    /// Anything else goes through the API only. Unknown ids and messages in
    /// any other state are left alone.
    pub async fn retry(&self, id: &MessageId) -> Result<(), SessionError> {
        let Some(message) = self.find_message(id) else {
            debug!(conversation = %self.conversation_id(), message = %id, "Retry of unknown message");
            return Ok(());
        };
        if message.delivery_status != DeliveryStatus::Failed {
            debug!(
                conversation = %self.conversation_id(),
                message = %id,
                status = ?message.delivery_status,
                "Retry ignored, message has not failed"
            );
            return Ok(());
        }

        let correlation_id = message.correlation_id.clone();
        self.mark_local(id, correlation_id.as_deref(), DeliveryStatus::Sending);
        self.update(|s| s.error.take().is_some());

        if let Some(entry) = self.queue().entry_for_message(id) {
            return self.retry_queued(id, correlation_id.as_deref(), entry).await;
        }

        let request = SendMessageRequest {
            content: message.content,
            kind: message.kind,
            reply_to: message.reply_to,
            correlation_id: correlation_id.clone(),
            attachments: Vec::new(),
        };

        match self.api().send_message(self.conversation_id(), &request).await {
            Ok(confirmed) => {
                info!(conversation = %self.conversation_id(), message = %id, "Retry succeeded");
                self.accept_confirmation(confirmed, Some(id)).await;
                Ok(())
            }
            Err(e) => {
                warn!(conversation = %self.conversation_id(), message = %id, error = %e, "Retry failed");
                self.fail_local(id, correlation_id.as_deref(), e.to_string());
                Err(e.into())
            }
        }
    }

    async fn retry_queued(
        &self,
        id: &MessageId,
        correlation_id: Option<&str>,
        entry: QueuedMessage,
    ) -> Result<(), SessionError> {
        match self.queue().retry_now(&entry.id).await {
            Ok(()) => {
                info!(
                    conversation = %self.conversation_id(),
                    message = %id,
                    queue_id = %entry.id,
                    "Queued retry succeeded"
                );
                // The transport owner may belong to another conversation.
                self.mark_local(id, correlation_id, DeliveryStatus::Sent);
                Ok(())
            }
            Err(e) => {
                warn!(
                    conversation = %self.conversation_id(),
                    message = %id,
                    queue_id = %entry.id,
                    error = %e,
                    "Queued retry failed"
                );
                self.fail_local(id, correlation_id, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Delete a message and run `on_done` once it is gone.
    ///
    /// A message that never reached the server is dropped locally together
    /// with any queued copy. If a send of it is still in flight, the server
    /// copy it produces is deleted as soon as it is confirmed. Otherwise the
    /// server delete must succeed first; on failure the message stays and
    /// `on_done` is not called.
    pub async fn delete<F>(&self, id: &MessageId, on_done: F) -> Result<(), SessionError>
    where
        F: FnOnce() + Send,
    {
        if id.is_temporary() {
            let local = self.find_message(id);
            let correlation_id = local.as_ref().and_then(|m| m.correlation_id.clone());
            self.discard_on_confirm(id, correlation_id.as_deref());

            let dequeued = self.queue().remove_for_message(id).await;
            let in_flight = dequeued.iter().any(|e| e.status == QueueStatus::Sending)
                || local.is_some_and(|m| m.delivery_status == DeliveryStatus::Sending);
            if !in_flight {
                self.take_discarded(id);
            }

            self.update(|s| reconciler::remove_message(&mut s.messages, id));
            info!(
                conversation = %self.conversation_id(),
                message = %id,
                dequeued = dequeued.len(),
                in_flight,
                "Deleted unsent message"
            );
            on_done();
            return Ok(());
        }

        match self.api().delete_message(self.conversation_id(), id).await {
            Ok(()) => {
                self.update(|s| reconciler::remove_message(&mut s.messages, id));
                info!(conversation = %self.conversation_id(), message = %id, "Message deleted");
                on_done();
                Ok(())
            }
            Err(e) => {
                error!(conversation = %self.conversation_id(), message = %id, error = %e, "Delete failed");
                let reason = e.to_string();
                self.update(|s| {
                    s.error = Some(reason);
                    true
                });
                Err(e.into())
            }
        }
    }
}
