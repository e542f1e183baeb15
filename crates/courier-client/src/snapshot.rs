use courier_shared::{Message, MessageId, UserId};
use serde::Serialize;

/// Everything a screen renders for one conversation. Published through a
/// `tokio::sync::watch` channel; consumers never mutate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub is_sending: bool,
    pub is_online: bool,
    pub typing_users: Vec<UserId>,
    pub online_users: Vec<UserId>,
    /// Last user-facing failure, cleared by the next successful action.
    pub error: Option<String>,
}

impl SessionSnapshot {
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }
}
