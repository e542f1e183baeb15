//! The chat [`Message`] record and its forward-only delivery state machine.
//!
//! Every status change, whether it comes from a local send, a retry, or an
//! inbound receipt, goes through [`apply_status`] so that a message can
//! never regress (e.g. `read` back to `delivered`). The one exception is
//! [`Message::fail_unconfirmed`], which only touches records the server has
//! never seen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Delivery status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    /// Position in the total order `sending < sent < delivered < read`.
    /// `failed` sits outside the order and has no rank.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Sent
    }
}

/// Resolve a proposed transition. Returns the status the message ends up
/// in, which is `current` whenever `incoming` would be illegal.
///
/// - `failed` is only reachable from `sending`.
/// - `sending` is only reachable from `failed` (explicit retry).
/// - a `failed` message may be confirmed by any later server status.
/// - otherwise the incoming status must rank strictly higher.
pub fn apply_status(current: DeliveryStatus, incoming: DeliveryStatus) -> DeliveryStatus {
    use DeliveryStatus::*;

    match (current, incoming) {
        (c, i) if c == i => current,
        (Sending, Failed) => Failed,
        (_, Failed) => current,
        (Failed, Sending) => Sending,
        (_, Sending) => current,
        (Failed, i) => i,
        (c, i) => match (c.rank(), i.rank()) {
            (Some(cr), Some(ir)) if ir > cr => incoming,
            _ => current,
        },
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    File,
    Location,
    Emoji,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// One chat message as held by a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Text payload, or a media URL for image / voice / file messages.
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    /// Weak back-reference; the target may no longer exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Client-generated key that survives the temp id -> server id swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    /// Build the optimistic local record appended before any network call.
    pub fn optimistic(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
        kind: MessageKind,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::temporary(),
            conversation_id,
            sender_id,
            content: content.into(),
            kind,
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Sending,
            read_by: Vec::new(),
            reply_to,
            correlation_id: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Route a status change through [`apply_status`]. Returns whether the
    /// status actually changed.
    pub fn apply_status(&mut self, incoming: DeliveryStatus) -> bool {
        let next = apply_status(self.delivery_status, incoming);
        let changed = next != self.delivery_status;
        self.delivery_status = next;
        changed
    }

    /// Give up on a message the server never acknowledged. A queued message
    /// shows `sent` while it still carries its temporary id, so that status
    /// counts as unconfirmed too. Server-assigned ids are left alone.
    pub fn fail_unconfirmed(&mut self) -> bool {
        if !self.id.is_temporary() {
            return false;
        }
        match self.delivery_status {
            DeliveryStatus::Sending => self.apply_status(DeliveryStatus::Failed),
            DeliveryStatus::Sent => {
                self.delivery_status = DeliveryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    pub fn is_read_by(&self, user_id: &UserId) -> bool {
        self.read_by.iter().any(|r| &r.user_id == user_id)
    }

    /// Record a read receipt; a user appears in `read_by` at most once.
    pub fn add_read_receipt(&mut self, user_id: &UserId, read_at: DateTime<Utc>) -> bool {
        if self.is_read_by(user_id) {
            return false;
        }
        self.read_by.push(ReadReceipt {
            user_id: user_id.clone(),
            read_at,
        });
        true
    }
}
