//! Offline message queue.
//!
//! Holds every outbound message that could not be confirmed yet, across all
//! conversations, and drives it to the server through whichever
//! [`SendHandler`] currently owns the [`Transport`]. The in-memory list is
//! authoritative; the [`QueueStore`] copy is rewritten after each mutation
//! and only read back by [`OfflineMessageQueue::open`].
//!
//! Retry policy: a failed entry is re-flushed after
//! `base_delay * retry_count` until it reaches `max_retries`. From then on
//! automatic passes skip it and only [`OfflineMessageQueue::retry_now`]
//! sends it again. Reaching the limit is announced as
//! [`QueueEvent::Exhausted`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use courier_net::ConnectivityMonitor;
use courier_shared::{ConversationId, MessageId, OutgoingMessage, QueueStatus, QueuedMessage};
use courier_store::QueueStore;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, SendError};
use crate::transport::{SendHandler, Transport};

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub sending: usize,
    pub failed: usize,
    /// Failed entries no longer retried automatically.
    pub exhausted: usize,
}

/// Things sessions need to hear about without polling the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// An entry used up its automatic retries and now waits for a manual
    /// retry.
    Exhausted(QueuedMessage),
}

const EVENT_BUFFER: usize = 64;

/// Cloneable handle; all clones share one queue.
#[derive(Clone)]
pub struct OfflineMessageQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    items: Mutex<Vec<QueuedMessage>>,
    /// Serializes writes so the store never goes back to an older list.
    persist_lock: tokio::sync::Mutex<()>,
    store: Arc<dyn QueueStore>,
    connectivity: ConnectivityMonitor,
    transport: Transport,
    config: QueueConfig,
    processing: AtomicBool,
    flush_calls: AtomicUsize,
    events: broadcast::Sender<QueueEvent>,
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineMessageQueue {
    /// Restore the queue from `store`.
    ///
    /// An unreadable store yields an empty queue. Entries a previous process
    /// left `sending` go back to `pending`, and expired entries are purged.
    pub async fn open(
        store: Arc<dyn QueueStore>,
        connectivity: ConnectivityMonitor,
        transport: Transport,
        config: QueueConfig,
    ) -> Self {
        let mut items = match store.load().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Failed to load offline queue, starting empty");
                Vec::new()
            }
        };

        let mut interrupted = 0;
        for item in items.iter_mut().filter(|i| i.status == QueueStatus::Sending) {
            item.status = QueueStatus::Pending;
            interrupted += 1;
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let queue = Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(items),
                persist_lock: tokio::sync::Mutex::new(()),
                store,
                connectivity,
                transport,
                config,
                processing: AtomicBool::new(false),
                flush_calls: AtomicUsize::new(0),
                events,
            }),
        };

        let purged = queue.purge_expired().await;
        if interrupted > 0 && purged == 0 {
            queue.persist().await;
        }

        info!(
            count = queue.len(),
            interrupted,
            purged,
            "Offline queue opened"
        );
        queue
    }

    fn items(&self) -> MutexGuard<'_, Vec<QueuedMessage>> {
        self.inner.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Register the delegate that transmits queued messages, on behalf of
    /// `owner`. Takes effect on the next flush.
    pub fn set_send_handler(
        &self,
        owner: ConversationId,
        handler: Arc<dyn SendHandler>,
    ) -> Option<ConversationId> {
        self.inner.transport.attach(owner, handler)
    }

    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Accept a message for eventual delivery and return its queue-local id.
    /// Flushes right away when connectivity is available.
    pub async fn enqueue(&self, message: OutgoingMessage) -> Result<String, QueueError> {
        if message.content.trim().is_empty() && message.attachments.is_empty() {
            return Err(QueueError::Empty);
        }

        let id = format!("queue_{}", Uuid::new_v4().simple());
        let conversation_id = message.conversation_id.clone();
        {
            let mut items = self.items();
            if items.len() >= self.inner.config.capacity {
                return Err(QueueError::Full(self.inner.config.capacity));
            }
            items.push(QueuedMessage::new(id.clone(), message, Utc::now()));
        }
        self.persist().await;

        debug!(queue_id = %id, conversation = %conversation_id, "Message queued");

        if self.inner.connectivity.is_connected() {
            self.schedule_flush(Duration::ZERO);
        }
        Ok(id)
    }

    /// Remove one entry. Returns `false` if it was not there.
    pub async fn dequeue(&self, id: &str) -> bool {
        let removed = {
            let mut items = self.items();
            let before = items.len();
            items.retain(|i| i.id != id);
            items.len() != before
        };
        if removed {
            self.persist().await;
            debug!(queue_id = %id, "Message dequeued");
        }
        removed
    }

    /// Drop every entry shadowing the optimistic message `message_id` and
    /// return them. An entry a flush is sending right now is removed too;
    /// its delivery still completes, so callers must look at the returned
    /// statuses.
    pub async fn remove_for_message(&self, message_id: &MessageId) -> Vec<QueuedMessage> {
        let removed: Vec<QueuedMessage> = {
            let mut items = self.items();
            let (removed, kept): (Vec<_>, Vec<_>) = items
                .drain(..)
                .partition(|i| i.local_message_id.as_ref() == Some(message_id));
            *items = kept;
            removed
        };
        if !removed.is_empty() {
            self.persist().await;
            debug!(
                message = %message_id,
                removed = removed.len(),
                "Removed queued copies of message"
            );
        }
        removed
    }

    /// Record a failed attempt and schedule the next automatic one if the
    /// entry has retries left. Returns the new retry count.
    pub async fn mark_failed(&self, id: &str) -> Option<u32> {
        let item = {
            let mut items = self.items();
            let item = items.iter_mut().find(|i| i.id == id)?;
            item.retry_count = item.retry_count.saturating_add(1);
            item.status = QueueStatus::Failed;
            item.clone()
        };
        let retry_count = item.retry_count;
        self.persist().await;

        let config = &self.inner.config;
        if retry_count < config.max_retries {
            let delay = config.backoff(retry_count);
            debug!(
                queue_id = %id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "Scheduling queue retry"
            );
            self.schedule_flush(delay);
        } else {
            warn!(
                queue_id = %id,
                retry_count,
                "Queued message exhausted automatic retries"
            );
            // No subscriber is fine: nobody is showing the message.
            let _ = self.inner.events.send(QueueEvent::Exhausted(item));
        }
        Some(retry_count)
    }

    /// Remove non-failed entries older than the retention window.
    pub async fn purge_expired(&self) -> usize {
        let retention = self.inner.config.retention;
        let now = Utc::now();
        let purged = {
            let mut items = self.items();
            let before = items.len();
            items.retain(|item| {
                if item.status == QueueStatus::Failed {
                    return true;
                }
                match (now - item.enqueued_at).to_std() {
                    Ok(age) => age <= retention,
                    // Enqueued "in the future": clock skew, keep it.
                    Err(_) => true,
                }
            });
            before - items.len()
        };
        if purged > 0 {
            self.persist().await;
            info!(purged, "Purged expired queue entries");
        }
        purged
    }

    // -----------------------------------------------------------------------
    // Flushing
    // -----------------------------------------------------------------------

    /// Send every eligible entry, in enqueue order.
    ///
    /// No-op while another pass is running, while offline, or with no
    /// handler attached. One entry's failure never stops the pass.
    pub async fn process_queue(&self) -> FlushReport {
        self.inner.flush_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue flush already in progress");
            return FlushReport::default();
        }
        let _guard = ProcessingGuard(&self.inner.processing);

        if !self.inner.connectivity.is_connected() {
            debug!("Offline, skipping queue flush");
            return FlushReport::default();
        }

        let Some(handler) = self.inner.transport.handler() else {
            debug!("No send handler attached, leaving queue untouched");
            return FlushReport::default();
        };

        self.purge_expired().await;

        let batch: Vec<String> = self
            .items()
            .iter()
            .filter(|i| self.is_eligible(i))
            .map(|i| i.id.clone())
            .collect();
        if batch.is_empty() {
            return FlushReport::default();
        }

        info!(count = batch.len(), "Flushing offline queue");

        let mut report = FlushReport::default();
        for id in batch {
            if !self.inner.connectivity.is_connected() {
                info!("Connectivity lost, stopping queue flush");
                break;
            }
            let Some(item) = self.begin_send(&id) else {
                continue;
            };
            self.persist().await;

            match deliver(handler.as_ref(), &item).await {
                Ok(()) => {
                    self.dequeue(&id).await;
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(
                        queue_id = %id,
                        conversation = %item.conversation_id,
                        error = %e,
                        "Queued message send failed"
                    );
                    self.mark_failed(&id).await;
                    report.failed += 1;
                }
            }
        }

        info!(sent = report.sent, failed = report.failed, "Queue flush finished");
        report
    }

    /// Send one entry now, whatever its retry count. Used for manual retry
    /// of entries that exhausted automatic retries.
    pub async fn retry_now(&self, id: &str) -> Result<(), QueueError> {
        let handler = self.inner.transport.handler().ok_or(QueueError::NoHandler)?;
        // Absent, or already being sent by a flush.
        let item = self
            .begin_send(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        self.persist().await;

        info!(queue_id = %id, retry_count = item.retry_count, "Manual queue retry");

        match deliver(handler.as_ref(), &item).await {
            Ok(()) => {
                self.dequeue(id).await;
                Ok(())
            }
            Err(e) => {
                warn!(queue_id = %id, error = %e, "Manual queue retry failed");
                self.mark_failed(id).await;
                Err(e.into())
            }
        }
    }

    fn is_eligible(&self, item: &QueuedMessage) -> bool {
        item.status != QueueStatus::Sending && item.retry_count < self.inner.config.max_retries
    }

    /// Flag an entry `sending` and return a copy, unless it is gone or
    /// already in flight.
    fn begin_send(&self, id: &str) -> Option<QueuedMessage> {
        let mut items = self.items();
        let item = items.iter_mut().find(|i| i.id == id)?;
        if item.status == QueueStatus::Sending {
            return None;
        }
        item.status = QueueStatus::Sending;
        Some(item.clone())
    }

    fn schedule_flush(&self, delay: Duration) {
        let queue = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = queue.upgrade() {
                OfflineMessageQueue { inner }.process_queue().await;
            }
        });
    }

    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let snapshot = self.snapshot();
        if let Err(e) = self.inner.store.save(&snapshot).await {
            warn!(
                error = %e,
                count = snapshot.len(),
                "Failed to persist offline queue"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.items().clone()
    }

    pub fn get(&self, id: &str) -> Option<QueuedMessage> {
        self.items().iter().find(|i| i.id == id).cloned()
    }

    /// The entry shadowing the optimistic message `message_id`, if any.
    pub fn entry_for_message(&self, message_id: &MessageId) -> Option<QueuedMessage> {
        self.items()
            .iter()
            .find(|i| i.local_message_id.as_ref() == Some(message_id))
            .cloned()
    }

    /// How many times [`process_queue`](Self::process_queue) has been
    /// called, including calls that turned out to be no-ops.
    pub fn flush_calls(&self) -> usize {
        self.inner.flush_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let max_retries = self.inner.config.max_retries;
        let items = self.items();
        let mut stats = QueueStats {
            total: items.len(),
            ..QueueStats::default()
        };
        for item in items.iter() {
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Sending => stats.sending += 1,
                QueueStatus::Failed => {
                    stats.failed += 1;
                    if item.retry_count >= max_retries {
                        stats.exhausted += 1;
                    }
                }
            }
        }
        stats
    }
}

/// Run the delegate, turning a panic into an ordinary failure.
async fn deliver(handler: &dyn SendHandler, item: &QueuedMessage) -> Result<(), SendError> {
    match AssertUnwindSafe(handler.send(item)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(queue_id = %item.id, "Send handler panicked");
            Err(SendError::Panicked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{settle, FailingStore, HandlerMode, RecordingHandler};
    use courier_store::MemoryQueueStore;

    fn out(content: &str) -> OutgoingMessage {
        OutgoingMessage::text(ConversationId::from("c1"), content)
    }

    async fn offline_queue(
        config: QueueConfig,
    ) -> (OfflineMessageQueue, ConnectivityMonitor, Arc<MemoryQueueStore>) {
        let store = Arc::new(MemoryQueueStore::new());
        let monitor = ConnectivityMonitor::new(false);
        let queue =
            OfflineMessageQueue::open(store.clone(), monitor.clone(), Transport::new(), config)
                .await;
        (queue, monitor, store)
    }

    fn attach(queue: &OfflineMessageQueue, mode: HandlerMode) -> Arc<RecordingHandler> {
        let handler = RecordingHandler::new(mode);
        queue.set_send_handler(ConversationId::from("c1"), handler.clone());
        handler
    }

    #[tokio::test]
    async fn enqueue_persists_pending_entry() {
        let (queue, _monitor, store) = offline_queue(QueueConfig::default()).await;

        let a = queue.enqueue(out("one")).await.unwrap();
        let b = queue.enqueue(out("two")).await.unwrap();
        assert_ne!(a, b);

        let persisted = store.load().await.unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].id, a);
        assert_eq!(persisted[0].status, QueueStatus::Pending);
        assert_eq!(persisted[0].retry_count, 0);
    }

    #[tokio::test]
    async fn blank_message_is_refused() {
        let (queue, _monitor, _store) = offline_queue(QueueConfig::default()).await;
        assert!(matches!(
            queue.enqueue(out("   ")).await,
            Err(QueueError::Empty)
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_refuses_new_entries() {
        let config = QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        };
        let (queue, _monitor, _store) = offline_queue(config).await;
        queue.enqueue(out("one")).await.unwrap();
        assert!(matches!(
            queue.enqueue(out("two")).await,
            Err(QueueError::Full(1))
        ));
    }

    #[tokio::test]
    async fn offline_or_unhandled_flush_is_a_no_op() {
        let (queue, monitor, _store) = offline_queue(QueueConfig::default()).await;
        let handler = attach(&queue, HandlerMode::Succeed);
        queue.enqueue(out("hi")).await.unwrap();

        assert_eq!(queue.process_queue().await, FlushReport::default());
        assert_eq!(handler.call_count(), 0);

        queue.transport().detach(&ConversationId::from("c1"));
        monitor.set_connected(true);
        assert_eq!(queue.process_queue().await, FlushReport::default());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot()[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn successful_flush_empties_queue_in_order() {
        let (queue, monitor, store) = offline_queue(QueueConfig::default()).await;
        let handler = attach(&queue, HandlerMode::Succeed);
        for content in ["a", "b", "c"] {
            queue.enqueue(out(content)).await.unwrap();
        }

        monitor.set_connected(true);
        let report = queue.process_queue().await;

        assert_eq!(report, FlushReport { sent: 3, failed: 0 });
        assert_eq!(handler.contents(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_while_online_flushes_immediately() {
        let (queue, monitor, _store) = offline_queue(QueueConfig::default()).await;
        let handler = attach(&queue, HandlerMode::Succeed);
        monitor.set_connected(true);

        queue.enqueue(out("now")).await.unwrap();
        settle().await;

        assert_eq!(handler.call_count(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let (queue, monitor, _store) = offline_queue(QueueConfig::default()).await;
        let handler = attach(&queue, HandlerMode::FailContent("b"));
        for content in ["a", "b", "c"] {
            queue.enqueue(out(content)).await.unwrap();
        }

        monitor.set_connected(true);
        let report = queue.process_queue().await;

        assert_eq!(report, FlushReport { sent: 2, failed: 1 });
        assert_eq!(handler.contents(), vec!["a", "b", "c"]);
        let left = queue.snapshot();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "b");
        assert_eq!(left[0].status, QueueStatus::Failed);
        assert_eq!(left[0].retry_count, 1);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let (queue, monitor, _store) = offline_queue(QueueConfig::default()).await;
        attach(&queue, HandlerMode::Panic);
        let id = queue.enqueue(out("boom")).await.unwrap();

        monitor.set_connected(true);
        let report = queue.process_queue().await;

        assert_eq!(report, FlushReport { sent: 0, failed: 1 });
        assert_eq!(queue.get(&id).unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_entry_is_reflushed_after_backoff() {
        let config = QueueConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            ..QueueConfig::default()
        };
        let (queue, monitor, _store) = offline_queue(config).await;
        let handler = attach(&queue, HandlerMode::FailAll);
        queue.enqueue(out("later")).await.unwrap();

        monitor.set_connected(true);
        queue.process_queue().await;
        assert_eq!(handler.call_count(), 1);

        // First retry after 2s.
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(handler.call_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.call_count(), 2);

        // Second retry 4s after that.
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(handler.call_count(), 2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_grows_until_exhausted_then_stays_visible() {
        let config = QueueConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            ..QueueConfig::default()
        };
        let (queue, monitor, _store) = offline_queue(config).await;
        let handler = attach(&queue, HandlerMode::FailAll);
        let id = queue.enqueue(out("stubborn")).await.unwrap();

        monitor.set_connected(true);
        queue.process_queue().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(handler.retry_counts(), vec![0, 1, 2]);
        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(queue.stats().exhausted, 1);

        // Automatic passes skip it.
        assert_eq!(queue.process_queue().await, FlushReport::default());
        assert_eq!(handler.call_count(), 3);

        // Manual retry still works.
        handler.set_mode(HandlerMode::Succeed);
        queue.retry_now(&id).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn concurrent_flush_is_a_no_op() {
        let (queue, monitor, _store) = offline_queue(QueueConfig::default()).await;
        let handler = attach(&queue, HandlerMode::Succeed);
        let gate = handler.hold();
        queue.enqueue(out("slow")).await.unwrap();
        monitor.set_connected(true);

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_queue().await }
        });
        settle().await;
        assert_eq!(queue.stats().sending, 1);

        assert_eq!(queue.process_queue().await, FlushReport::default());

        gate.notify_one();
        assert_eq!(first.await.unwrap(), FlushReport { sent: 1, failed: 0 });
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn retry_now_requires_handler_and_entry() {
        let (queue, _monitor, _store) = offline_queue(QueueConfig::default()).await;
        let id = queue.enqueue(out("x")).await.unwrap();

        assert!(matches!(
            queue.retry_now(&id).await,
            Err(QueueError::NoHandler)
        ));

        let handler = attach(&queue, HandlerMode::FailAll);
        assert!(matches!(
            queue.retry_now("missing").await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            queue.retry_now(&id).await,
            Err(QueueError::Send(_))
        ));
        assert_eq!(handler.call_count(), 1);
        assert_eq!(queue.get(&id).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn dequeue_is_idempotent() {
        let (queue, _monitor, _store) = offline_queue(QueueConfig::default()).await;
        let id = queue.enqueue(out("x")).await.unwrap();
        assert!(queue.dequeue(&id).await);
        assert!(!queue.dequeue(&id).await);
    }

    #[tokio::test]
    async fn remove_for_message_drops_shadowing_entries() {
        let (queue, _monitor, _store) = offline_queue(QueueConfig::default()).await;
        let local = MessageId::temporary();
        let mut message = out("x");
        message.local_message_id = Some(local.clone());
        queue.enqueue(message).await.unwrap();
        queue.enqueue(out("other")).await.unwrap();

        assert!(queue.entry_for_message(&local).is_some());
        let removed = queue.remove_for_message(&local).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].status, QueueStatus::Pending);
        assert_eq!(queue.len(), 1);
        assert!(queue.entry_for_message(&local).is_none());
    }

    #[tokio::test]
    async fn removing_an_entry_mid_send_reports_it_as_sending() {
        let (queue, monitor, _store) = offline_queue(QueueConfig::default()).await;
        let handler = attach(&queue, HandlerMode::Succeed);
        let gate = handler.hold();
        let local = MessageId::temporary();
        let mut message = out("in flight");
        message.local_message_id = Some(local.clone());
        queue.enqueue(message).await.unwrap();
        monitor.set_connected(true);

        let flush = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_queue().await }
        });
        settle().await;

        let removed = queue.remove_for_message(&local).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].status, QueueStatus::Sending);

        gate.notify_one();
        assert_eq!(flush.await.unwrap(), FlushReport { sent: 1, failed: 0 });
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn exhaustion_is_announced_once_per_failure_past_the_limit() {
        let config = QueueConfig {
            max_retries: 2,
            base_delay: Duration::from_secs(3600),
            ..QueueConfig::default()
        };
        let (queue, monitor, _store) = offline_queue(config).await;
        attach(&queue, HandlerMode::FailAll);
        let mut events = queue.events();
        let id = queue.enqueue(out("doomed")).await.unwrap();
        monitor.set_connected(true);

        queue.process_queue().await;
        assert!(events.try_recv().is_err());

        queue.retry_now(&id).await.unwrap_err();
        match events.try_recv().unwrap() {
            QueueEvent::Exhausted(item) => {
                assert_eq!(item.id, id);
                assert_eq!(item.retry_count, 2);
                assert_eq!(item.status, QueueStatus::Failed);
            }
        }
    }

    #[tokio::test]
    async fn every_flush_call_is_counted() {
        let (queue, monitor, _store) = offline_queue(QueueConfig::default()).await;
        assert_eq!(queue.flush_calls(), 0);

        queue.process_queue().await;
        monitor.set_connected(true);
        queue.process_queue().await;

        assert_eq!(queue.flush_calls(), 2);
    }

    #[tokio::test]
    async fn open_recovers_interrupted_and_purges_expired() {
        let old = Utc::now() - chrono::Duration::days(8);
        let mut stale = QueuedMessage::new("stale".into(), out("old"), old);
        stale.status = QueueStatus::Pending;
        let mut kept_failed = QueuedMessage::new("failed".into(), out("old failed"), old);
        kept_failed.status = QueueStatus::Failed;
        kept_failed.retry_count = 5;
        let mut interrupted = QueuedMessage::new("interrupted".into(), out("new"), Utc::now());
        interrupted.status = QueueStatus::Sending;

        let store = Arc::new(MemoryQueueStore::with_items(vec![
            stale,
            kept_failed,
            interrupted,
        ]));
        let queue = OfflineMessageQueue::open(
            store.clone(),
            ConnectivityMonitor::new(false),
            Transport::new(),
            QueueConfig::default(),
        )
        .await;

        let ids: Vec<String> = queue.snapshot().into_iter().map(|q| q.id).collect();
        assert_eq!(ids, vec!["failed", "interrupted"]);
        assert_eq!(
            queue.get("interrupted").unwrap().status,
            QueueStatus::Pending
        );
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persistence_failures_do_not_break_the_queue() {
        let queue = OfflineMessageQueue::open(
            Arc::new(FailingStore),
            ConnectivityMonitor::new(false),
            Transport::new(),
            QueueConfig::default(),
        )
        .await;
        assert!(queue.is_empty());

        let id = queue.enqueue(out("still here")).await.unwrap();
        assert_eq!(queue.get(&id).unwrap().content, "still here");
        assert!(queue.dequeue(&id).await);
    }
}
