//! The assembled client: one API, one realtime connection, one offline queue,
//! and any number of open conversation sessions sharing them.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use courier_net::{
    spawn_realtime, ChatApi, ConnectivityMonitor, HttpChatApi, PresenceTracker, RealtimeChannel,
    RealtimeConfig, RealtimeHandle, RealtimeNotification, Subscription,
};
use courier_shared::{ClientEvent, ConversationId, UserId};
use courier_store::{Database, QueueStore, SqliteQueueStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{spawn_bridge, Bridge};
use crate::config::ClientConfig;
use crate::network::{mirror_online, resume_on_reconnect, route_queue_events};
use crate::queue::OfflineMessageQueue;
use crate::registry::SessionRegistry;
use crate::session::{ChatSession, SessionContext};
use crate::transport::Transport;

/// Pre-built collaborators for [`ChatClient::from_parts`].
pub struct ClientParts {
    pub api: Arc<dyn ChatApi>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub store: Arc<dyn QueueStore>,
    /// Notifications of the realtime task; `None` when nothing feeds them.
    pub notifications: Option<mpsc::Receiver<RealtimeNotification>>,
}

pub struct ChatClient {
    config: ClientConfig,
    context: SessionContext,
    registry: SessionRegistry,
    presence: Arc<Mutex<PresenceTracker>>,
    realtime_handle: Option<RealtimeHandle>,
    bridge_task: Option<JoinHandle<()>>,
    queue_task: JoinHandle<()>,
    _subscriptions: Vec<Subscription>,
}

impl ChatClient {
    /// Connect to the configured backend and open the persistent queue.
    pub async fn connect(config: ClientConfig) -> anyhow::Result<Self> {
        let api = HttpChatApi::new(config.api_url.clone(), config.auth_token.clone())
            .context("Failed to build API client")?;

        let database = match &config.queue_db_path {
            Some(path) => Database::open_at(path),
            None => Database::new(),
        }
        .context("Failed to open queue database")?;
        let store = SqliteQueueStore::new(Arc::new(database));

        let mut realtime_config = RealtimeConfig::new(config.realtime_url.clone());
        realtime_config.auth_token = config.auth_token.clone();
        let (handle, notifications) = spawn_realtime(realtime_config);

        let parts = ClientParts {
            api: Arc::new(api),
            realtime: Arc::new(handle.clone()),
            store: Arc::new(store),
            notifications: Some(notifications),
        };
        let mut client = Self::from_parts(config, parts).await;
        client.realtime_handle = Some(handle);
        Ok(client)
    }

    /// Assemble a client around already-built collaborators.
    pub async fn from_parts(config: ClientConfig, parts: ClientParts) -> Self {
        let monitor = ConnectivityMonitor::new(parts.realtime.is_connected());
        let queue = OfflineMessageQueue::open(
            parts.store,
            monitor.clone(),
            Transport::new(),
            config.queue.clone(),
        )
        .await;

        let context = SessionContext {
            user_id: config.user_id.clone(),
            api: parts.api,
            realtime: parts.realtime,
            connectivity: monitor.clone(),
            queue: queue.clone(),
            typing_idle: config.typing_idle,
        };
        let registry = SessionRegistry::new();
        let presence = Arc::new(Mutex::new(PresenceTracker::new()));

        let subscriptions = vec![
            resume_on_reconnect(queue.clone(), &monitor),
            mirror_online(registry.clone(), &monitor),
        ];

        let bridge_task = parts.notifications.map(|notifications| {
            let bridge = Bridge {
                registry: registry.clone(),
                queue: queue.clone(),
                monitor: monitor.clone(),
                presence: presence.clone(),
            };
            spawn_bridge(bridge, notifications)
        });
        let queue_task = route_queue_events(&queue, registry.clone());

        info!(user = %config.user_id, queued = queue.len(), "Chat client ready");

        Self {
            config,
            context,
            registry,
            presence,
            realtime_handle: None,
            bridge_task,
            queue_task,
            _subscriptions: subscriptions,
        }
    }

    /// Open (or return the already open) session for a conversation. The
    /// session opened or switched to last takes over the transport for
    /// queued messages.
    pub fn open_session(&self, conversation_id: ConversationId) -> ChatSession {
        if let Some(existing) = self.registry.get(&conversation_id) {
            self.queue()
                .set_send_handler(conversation_id, existing.send_handler());
            return existing;
        }

        let session = ChatSession::new(conversation_id.clone(), self.context.clone());
        self.registry.insert(session.clone());

        let join = ClientEvent::JoinConversation {
            conversation_id: conversation_id.clone(),
        };
        if let Err(e) = self.context.realtime.emit(join) {
            warn!(conversation = %conversation_id, error = %e, "Failed to join conversation");
        }

        self.queue()
            .set_send_handler(conversation_id.clone(), session.send_handler());
        info!(conversation = %conversation_id, "Session opened");

        if self.is_online() && !self.queue().is_empty() {
            let queue = self.queue().clone();
            tokio::spawn(async move {
                queue.process_queue().await;
            });
        }
        session
    }

    /// Close a session. If it owned the transport, another open session
    /// takes it over.
    pub fn close_session(&self, conversation_id: &ConversationId) -> bool {
        let Some(_session) = self.registry.remove(conversation_id) else {
            return false;
        };

        let leave = ClientEvent::LeaveConversation {
            conversation_id: conversation_id.clone(),
        };
        if let Err(e) = self.context.realtime.emit(leave) {
            debug!(conversation = %conversation_id, error = %e, "Failed to leave conversation");
        }

        if self.queue().transport().detach(conversation_id) {
            if let Some(next) = self.registry.all().into_iter().next() {
                self.queue()
                    .set_send_handler(next.conversation_id().clone(), next.send_handler());
            }
        }

        info!(conversation = %conversation_id, "Session closed");
        true
    }

    pub fn session(&self, conversation_id: &ConversationId) -> Option<ChatSession> {
        self.registry.get(conversation_id)
    }

    pub fn sessions(&self) -> Vec<ChatSession> {
        self.registry.all()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user_id(&self) -> &UserId {
        &self.config.user_id
    }

    pub fn queue(&self) -> &OfflineMessageQueue {
        &self.context.queue
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.context.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.context.connectivity.is_connected()
    }

    /// Presence across every conversation the server reported on.
    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_online(user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .online_users()
    }

    /// Leave every conversation and stop the realtime task. Queued messages
    /// stay persisted for the next start.
    pub async fn shutdown(mut self) {
        for session in self.registry.all() {
            self.close_session(session.conversation_id());
        }
        if let Some(handle) = self.realtime_handle.take() {
            handle.shutdown().await;
        }
        info!(queued = self.queue().len(), "Chat client shut down");
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(task) = self.bridge_task.take() {
            task.abort();
        }
        self.queue_task.abort();
    }
}
