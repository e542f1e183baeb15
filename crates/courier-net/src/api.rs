//! Durable request/response path to the chat backend.
//!
//! The API is the source of truth for persistence: a message counts as
//! `sent` once [`ChatApi::send_message`] returns the server's echo.

use std::time::Duration;

use async_trait::async_trait;
use courier_shared::{Attachment, ConversationId, Message, MessageId, MessageKind};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;

/// Request-level timeout; the delivery engine adds none of its own.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Body of `POST /conversations/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl SendMessageRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            reply_to: None,
            correlation_id: None,
            attachments: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Persist a message; returns the server-authoritative record.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<Message, ApiError>;

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ApiError>;

    async fn get_messages(&self, conversation_id: &ConversationId)
        -> Result<Vec<Message>, ApiError>;
}

/// [`ChatApi`] over HTTP+JSON.
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn messages_url(&self, conversation_id: &ConversationId) -> String {
        format!("{}/conversations/{}/messages", self.base_url, conversation_id)
    }

    fn message_url(&self, conversation_id: &ConversationId, message_id: &MessageId) -> String {
        format!("{}/{}", self.messages_url(conversation_id), message_id)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Turn a non-2xx response into a classified [`ApiError`].
async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(status.as_u16(), body))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<Message, ApiError> {
        let url = self.messages_url(conversation_id);
        debug!(conversation = %conversation_id, "POST {}", url);

        let response = self
            .authorized(self.client.post(&url))
            .json(request)
            .send()
            .await?;
        Ok(check(response).await?.json::<Message>().await?)
    }

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ApiError> {
        let url = self.message_url(conversation_id, message_id);
        debug!(conversation = %conversation_id, message = %message_id, "DELETE {}", url);

        let response = self.authorized(self.client.delete(&url)).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn get_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError> {
        let url = self.messages_url(conversation_id);
        debug!(conversation = %conversation_id, "GET {}", url);

        let response = self.authorized(self.client.get(&url)).send().await?;
        Ok(check(response).await?.json::<Vec<Message>>().await?)
    }
}
