//! Realtime notification loop.
//!
//! Turns what the realtime task reports into connectivity changes and routes
//! server events to the session of their conversation.

use std::sync::{Arc, Mutex, PoisonError};

use courier_net::{ConnectivityMonitor, PresenceTracker, RealtimeNotification};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::OfflineMessageQueue;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub(crate) struct Bridge {
    pub(crate) registry: SessionRegistry,
    pub(crate) queue: OfflineMessageQueue,
    pub(crate) monitor: ConnectivityMonitor,
    pub(crate) presence: Arc<Mutex<PresenceTracker>>,
}

impl Bridge {
    pub(crate) fn dispatch(&self, notification: RealtimeNotification) {
        match notification {
            RealtimeNotification::Connected => {
                info!("Realtime connected (bridge)");
                // A transition is picked up by the reconnect subscriber.
                if !self.monitor.set_connected(true) && !self.queue.is_empty() {
                    let queue = self.queue.clone();
                    tokio::spawn(async move {
                        queue.process_queue().await;
                    });
                }
            }

            RealtimeNotification::Disconnected { reason } => {
                warn!(reason = %reason, "Realtime disconnected (bridge)");
                self.monitor.set_connected(false);
            }

            RealtimeNotification::Event(event) => {
                let presence_changed = self
                    .presence
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply(&event);
                if presence_changed {
                    debug!(conversation = %event.conversation_id(), "Presence updated");
                }

                match self.registry.get(event.conversation_id()) {
                    Some(session) => session.handle_event(event),
                    None => debug!(
                        conversation = %event.conversation_id(),
                        "No open session for event, dropping"
                    ),
                }
            }
        }
    }
}

pub(crate) fn spawn_bridge(
    bridge: Bridge,
    mut notifications: mpsc::Receiver<RealtimeNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Realtime bridge started");
        while let Some(notification) = notifications.recv().await {
            bridge.dispatch(notification);
        }
        info!("Realtime bridge stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{message, settle, HandlerMode, Harness, RecordingHandler};
    use courier_shared::{ConversationId, DeliveryStatus, OutgoingMessage, ServerEvent, UserId};

    fn bridge(h: &Harness) -> Bridge {
        Bridge {
            registry: SessionRegistry::new(),
            queue: h.queue.clone(),
            monitor: h.monitor.clone(),
            presence: Arc::new(Mutex::new(PresenceTracker::new())),
        }
    }

    #[tokio::test]
    async fn events_reach_their_session() {
        let h = Harness::new(true).await;
        let bridge = bridge(&h);
        let session = h.session("c1");
        bridge.registry.insert(session.clone());

        bridge.dispatch(RealtimeNotification::Event(ServerEvent::NewMessage(
            message("s1", "bob", DeliveryStatus::Sent),
        )));
        let mut elsewhere = message("s2", "bob", DeliveryStatus::Sent);
        elsewhere.conversation_id = ConversationId::from("c2");
        bridge.dispatch(RealtimeNotification::Event(ServerEvent::NewMessage(elsewhere)));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].id.as_str(), "s1");
    }

    #[tokio::test]
    async fn presence_is_tracked_without_open_session() {
        let h = Harness::new(true).await;
        let bridge = bridge(&h);

        bridge.dispatch(RealtimeNotification::Event(ServerEvent::UserOnline {
            conversation_id: ConversationId::from("c9"),
            user_id: UserId::from("bob"),
        }));

        assert!(bridge.presence.lock().unwrap().is_online(&UserId::from("bob")));
    }

    #[tokio::test]
    async fn connection_notifications_drive_connectivity() {
        let h = Harness::new(false).await;
        let bridge = bridge(&h);

        bridge.dispatch(RealtimeNotification::Connected);
        assert!(h.monitor.is_connected());

        bridge.dispatch(RealtimeNotification::Disconnected {
            reason: "closed".into(),
        });
        assert!(!h.monitor.is_connected());
    }

    #[tokio::test]
    async fn repeated_connect_still_flushes_waiting_messages() {
        let h = Harness::new(true).await;
        let bridge = bridge(&h);
        let handler = RecordingHandler::new(HandlerMode::Succeed);
        h.monitor.set_connected(false);
        h.queue
            .enqueue(OutgoingMessage::text(ConversationId::from("c1"), "waiting"))
            .await
            .unwrap();
        h.monitor.set_connected(true);
        h.queue
            .set_send_handler(ConversationId::from("c1"), handler.clone());

        bridge.dispatch(RealtimeNotification::Connected);
        settle().await;

        assert_eq!(handler.call_count(), 1);
        assert_eq!(h.queue.flush_calls(), 1);
        assert!(h.queue.is_empty());
    }
}
