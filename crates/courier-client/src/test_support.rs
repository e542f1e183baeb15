//! Fakes shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_net::{ApiError, ChatApi, ConnectivityMonitor, RealtimeChannel, RealtimeError, SendMessageRequest};
use courier_shared::constants::TYPING_IDLE_MS;
use courier_shared::{
    ClientEvent, ConversationId, DeliveryStatus, Message, MessageId, MessageKind, QueuedMessage,
    UserId,
};
use courier_store::{MemoryQueueStore, QueueStore, StoreError};
use tokio::sync::Notify;

use crate::config::QueueConfig;
use crate::error::SendError;
use crate::queue::OfflineMessageQueue;
use crate::session::{ChatSession, SessionContext};
use crate::transport::{SendHandler, Transport};

pub(crate) const ME: &str = "me";

/// Let spawned tasks run to their next await point.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn message(id: &str, sender: &str, status: DeliveryStatus) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from("c1"),
        sender_id: UserId::from(sender),
        content: format!("content of {id}"),
        kind: MessageKind::Text,
        created_at: Utc::now(),
        delivery_status: status,
        read_by: Vec::new(),
        reply_to: None,
        correlation_id: None,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

// ---------------------------------------------------------------------------
// Queue delegates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum HandlerMode {
    Succeed,
    FailAll,
    FailContent(&'static str),
    Panic,
}

pub(crate) struct RecordingHandler {
    mode: Mutex<HandlerMode>,
    calls: Mutex<Vec<QueuedMessage>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingHandler {
    pub(crate) fn new(mode: HandlerMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        })
    }

    pub(crate) fn set_mode(&self, mode: HandlerMode) {
        *lock(&self.mode) = mode;
    }

    pub(crate) fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub(crate) fn contents(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.content.clone()).collect()
    }

    pub(crate) fn retry_counts(&self) -> Vec<u32> {
        lock(&self.calls).iter().map(|c| c.retry_count).collect()
    }

    /// Block the next call until the returned gate is notified.
    pub(crate) fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl SendHandler for RecordingHandler {
    async fn send(&self, item: &QueuedMessage) -> Result<(), SendError> {
        lock(&self.calls).push(item.clone());

        let gate = lock(&self.gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mode = lock(&self.mode).clone();
        match mode {
            HandlerMode::Succeed => Ok(()),
            HandlerMode::FailAll => Err(ApiError::Network("unreachable".into()).into()),
            HandlerMode::FailContent(content) if item.content == content => {
                Err(ApiError::from_status(503, "unavailable").into())
            }
            HandlerMode::FailContent(_) => Ok(()),
            HandlerMode::Panic => panic!("handler blew up"),
        }
    }
}

/// A store whose disk is gone.
pub(crate) struct FailingStore;

#[async_trait]
impl QueueStore for FailingStore {
    async fn load(&self) -> courier_store::Result<Vec<QueuedMessage>> {
        Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk unavailable")))
    }

    async fn save(&self, _items: &[QueuedMessage]) -> courier_store::Result<()> {
        Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk unavailable")))
    }
}

// ---------------------------------------------------------------------------
// Network fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockApi {
    requests: Mutex<Vec<(ConversationId, SendMessageRequest)>>,
    send_failures: Mutex<VecDeque<ApiError>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    history: Mutex<Vec<Message>>,
    history_failures: Mutex<VecDeque<ApiError>>,
    deleted: Mutex<Vec<MessageId>>,
    delete_failures: Mutex<VecDeque<ApiError>>,
    next_id: AtomicUsize,
}

impl MockApi {
    pub(crate) fn fail_next_send(&self, error: ApiError) {
        lock(&self.send_failures).push_back(error);
    }

    pub(crate) fn fail_next_history(&self, error: ApiError) {
        lock(&self.history_failures).push_back(error);
    }

    pub(crate) fn fail_next_delete(&self, error: ApiError) {
        lock(&self.delete_failures).push_back(error);
    }

    /// Block the next send until the returned gate is notified.
    pub(crate) fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.send_gate) = Some(gate.clone());
        gate
    }

    pub(crate) fn set_history(&self, messages: Vec<Message>) {
        *lock(&self.history) = messages;
    }

    pub(crate) fn requests(&self) -> Vec<SendMessageRequest> {
        lock(&self.requests).iter().map(|(_, r)| r.clone()).collect()
    }

    pub(crate) fn send_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub(crate) fn deleted(&self) -> Vec<MessageId> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<Message, ApiError> {
        lock(&self.requests).push((conversation_id.clone(), request.clone()));

        let gate = lock(&self.send_gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(error) = lock(&self.send_failures).pop_front() {
            return Err(error);
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Message {
            id: MessageId(format!("srv_{n}")),
            conversation_id: conversation_id.clone(),
            sender_id: UserId::from(ME),
            content: request.content.clone(),
            kind: request.kind,
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Sent,
            read_by: Vec::new(),
            reply_to: request.reply_to.clone(),
            correlation_id: request.correlation_id.clone(),
        })
    }

    async fn delete_message(
        &self,
        _conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ApiError> {
        if let Some(error) = lock(&self.delete_failures).pop_front() {
            return Err(error);
        }
        lock(&self.deleted).push(message_id.clone());
        Ok(())
    }

    async fn get_messages(&self, _conversation_id: &ConversationId) -> Result<Vec<Message>, ApiError> {
        if let Some(error) = lock(&self.history_failures).pop_front() {
            return Err(error);
        }
        Ok(lock(&self.history).clone())
    }
}

#[derive(Default)]
pub(crate) struct MockRealtime {
    connected: AtomicBool,
    fail_emits: AtomicBool,
    emitted: Mutex<Vec<ClientEvent>>,
}

impl MockRealtime {
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every emit fail as if the socket dropped the frame.
    pub(crate) fn fail_emits(&self, fail: bool) {
        self.fail_emits.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn emitted(&self) -> Vec<ClientEvent> {
        lock(&self.emitted).clone()
    }
}

impl RealtimeChannel for MockRealtime {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ClientEvent) -> Result<(), RealtimeError> {
        let membership = matches!(
            event,
            ClientEvent::JoinConversation { .. } | ClientEvent::LeaveConversation { .. }
        );
        if self.fail_emits.load(Ordering::SeqCst) {
            return Err(RealtimeError::Closed);
        }
        if !membership && !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        lock(&self.emitted).push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub(crate) struct Harness {
    pub api: Arc<MockApi>,
    pub realtime: Arc<MockRealtime>,
    pub monitor: ConnectivityMonitor,
    pub queue: OfflineMessageQueue,
    pub store: Arc<MemoryQueueStore>,
}

impl Harness {
    pub(crate) async fn new(online: bool) -> Self {
        Self::with_queue_config(online, QueueConfig::default()).await
    }

    pub(crate) async fn with_queue_config(online: bool, config: QueueConfig) -> Self {
        let api = Arc::new(MockApi::default());
        let realtime = Arc::new(MockRealtime::default());
        realtime.set_connected(online);
        let monitor = ConnectivityMonitor::new(online);
        let store = Arc::new(MemoryQueueStore::new());
        let queue =
            OfflineMessageQueue::open(store.clone(), monitor.clone(), Transport::new(), config)
                .await;

        Self {
            api,
            realtime,
            monitor,
            queue,
            store,
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.realtime.set_connected(online);
        self.monitor.set_connected(online);
    }

    pub(crate) fn context(&self) -> SessionContext {
        SessionContext {
            user_id: UserId::from(ME),
            api: self.api.clone(),
            realtime: self.realtime.clone(),
            connectivity: self.monitor.clone(),
            queue: self.queue.clone(),
            typing_idle: Duration::from_millis(TYPING_IDLE_MS),
        }
    }

    pub(crate) fn session(&self, conversation_id: &str) -> ChatSession {
        ChatSession::new(ConversationId::from(conversation_id), self.context())
    }
}
