//! # courier-shared
//!
//! Types shared by every layer of the message delivery engine: identifiers,
//! the [`Message`](message::Message) record and its delivery state machine,
//! queued outbound transmissions, and the realtime wire protocol.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod queued;
pub mod types;

pub use error::ProtocolError;
pub use message::{apply_status, DeliveryStatus, Message, MessageKind, ReadReceipt};
pub use protocol::{ClientEvent, ServerEvent};
pub use queued::{Attachment, OutgoingMessage, QueueStatus, QueuedMessage};
pub use types::{ConversationId, MessageId, UserId};
