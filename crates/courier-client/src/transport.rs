//! Ownership of the physical send path.
//!
//! One conversation at a time owns transmission of queued messages. The
//! owner hands in a [`SendHandler`] with [`Transport::attach`] and gives it
//! back with [`Transport::detach`]; both are logged so a handover can be
//! traced.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use courier_shared::{ConversationId, QueuedMessage};
use tracing::{debug, info};

use crate::error::SendError;

/// Delegate that actually transmits one queued message.
#[async_trait]
pub trait SendHandler: Send + Sync {
    async fn send(&self, item: &QueuedMessage) -> Result<(), SendError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> SendHandler for FnHandler<F>
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SendError>> + Send + 'static,
{
    async fn send(&self, item: &QueuedMessage) -> Result<(), SendError> {
        (self.0)(item.clone()).await
    }
}

/// Wrap an async closure as a [`SendHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn SendHandler>
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SendError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Owner {
    conversation_id: ConversationId,
    handler: Arc<dyn SendHandler>,
}

#[derive(Clone, Default)]
pub struct Transport {
    owner: Arc<Mutex<Option<Owner>>>,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Owner>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `owner` the transmitting conversation. Returns the previous owner.
    pub fn attach(
        &self,
        owner: ConversationId,
        handler: Arc<dyn SendHandler>,
    ) -> Option<ConversationId> {
        let previous = self
            .lock()
            .replace(Owner {
                conversation_id: owner.clone(),
                handler,
            })
            .map(|o| o.conversation_id);

        match &previous {
            Some(prev) => info!(owner = %owner, previous = %prev, "Transport handed over"),
            None => info!(owner = %owner, "Transport attached"),
        }
        previous
    }

    /// Release the transport, but only if `owner` still holds it.
    pub fn detach(&self, owner: &ConversationId) -> bool {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(current) if &current.conversation_id == owner => {
                *guard = None;
                info!(owner = %owner, "Transport detached");
                true
            }
            Some(current) => {
                debug!(
                    owner = %owner,
                    current = %current.conversation_id,
                    "Ignoring detach from non-owner"
                );
                false
            }
            None => false,
        }
    }

    pub fn owner(&self) -> Option<ConversationId> {
        self.lock().as_ref().map(|o| o.conversation_id.clone())
    }

    pub fn handler(&self) -> Option<Arc<dyn SendHandler>> {
        self.lock().as_ref().map(|o| o.handler.clone())
    }
}
