//! Outbound transmission units owned by the offline queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageKind;
use crate::types::{ConversationId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sending,
    Failed,
}

/// A media attachment carried by a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub uri: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// What a caller hands to the queue. The queue assigns the id, timestamp
/// and retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<MessageId>,
    pub attachments: Vec<Attachment>,
    /// The optimistic message this transmission shadows, if any.
    pub local_message_id: Option<MessageId>,
    pub correlation_id: Option<String>,
}

impl OutgoingMessage {
    pub fn text(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            kind: MessageKind::Text,
            reply_to: None,
            attachments: Vec::new(),
            local_message_id: None,
            correlation_id: None,
        }
    }
}

/// One pending outbound transmission. Its `id` is queue-local and distinct
/// from the id of the message it shadows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: QueueStatus,
}

impl QueuedMessage {
    pub fn new(id: String, message: OutgoingMessage, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            conversation_id: message.conversation_id,
            content: message.content,
            kind: message.kind,
            reply_to: message.reply_to,
            attachments: message.attachments,
            local_message_id: message.local_message_id,
            correlation_id: message.correlation_id,
            enqueued_at,
            retry_count: 0,
            status: QueueStatus::Pending,
        }
    }
}
