use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::message::{Message, MessageKind};
use crate::types::{ConversationId, MessageId, UserId};

/// Events the client emits on the realtime channel.
/// Encoded as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    LeaveConversation { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    MarkRead { conversation_id: ConversationId },
}

/// Events pushed by the server. Every variant is scoped to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message from a peer, or the echo of one of ours.
    NewMessage(Message),

    /// Our own message was persisted by the server.
    #[serde(rename_all = "camelCase")]
    MessageSent {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<MessageId>,
    },

    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },

    /// `message_ids: None` means "every earlier message of mine you had not read".
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        #[serde(default)]
        message_ids: Option<Vec<MessageId>>,
        #[serde(default)]
        read_at: Option<DateTime<Utc>>,
    },

    #[serde(rename_all = "camelCase")]
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserOnline {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[serde(rename_all = "camelCase")]
    UserOffline {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::JoinConversation { conversation_id }
            | Self::LeaveConversation { conversation_id }
            | Self::SendMessage {
                conversation_id, ..
            }
            | Self::Typing {
                conversation_id, ..
            }
            | Self::MarkRead { conversation_id } => conversation_id,
        }
    }
}

impl ServerEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The conversation this event belongs to, used to route it to the
    /// mounted session.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::NewMessage(message) | Self::MessageSent { message, .. } => {
                &message.conversation_id
            }
            Self::MessageDelivered {
                conversation_id, ..
            }
            | Self::MessagesRead {
                conversation_id, ..
            }
            | Self::UserTyping {
                conversation_id, ..
            }
            | Self::UserOnline {
                conversation_id, ..
            }
            | Self::UserOffline {
                conversation_id, ..
            } => conversation_id,
        }
    }
}
