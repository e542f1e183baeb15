use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use courier_shared::ConversationId;

use crate::session::ChatSession;

/// Open sessions by conversation.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<ConversationId, ChatSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<ChatSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
    }

    /// Register `session`, returning any session it replaced.
    pub fn insert(&self, session: ChatSession) -> Option<ChatSession> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.conversation_id().clone(), session)
    }

    pub fn remove(&self, conversation_id: &ConversationId) -> Option<ChatSession> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id)
    }

    pub fn all(&self) -> Vec<ChatSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
