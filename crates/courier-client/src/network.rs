//! Reactions to connectivity transitions and to queue events.

use courier_net::{ConnectivityMonitor, Subscription};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::{OfflineMessageQueue, QueueEvent};
use crate::registry::SessionRegistry;

/// Flush the queue every time connectivity comes back, if anything is
/// waiting. Overlapping flushes collapse into one inside the queue.
pub fn resume_on_reconnect(queue: OfflineMessageQueue, monitor: &ConnectivityMonitor) -> Subscription {
    monitor.subscribe(move |connected| {
        if !connected {
            debug!("Offline, queued messages will wait");
            return;
        }
        if queue.is_empty() {
            return;
        }
        info!(count = queue.len(), "Back online, flushing offline queue");
        let queue = queue.clone();
        tokio::spawn(async move {
            queue.process_queue().await;
        });
    })
}

/// Keep every open session's `is_online` flag in step with connectivity.
pub fn mirror_online(registry: SessionRegistry, monitor: &ConnectivityMonitor) -> Subscription {
    monitor.subscribe(move |connected| {
        for session in registry.all() {
            session.set_online(connected);
        }
    })
}

/// Hand every queue event to the open session of its conversation.
pub fn route_queue_events(queue: &OfflineMessageQueue, registry: SessionRegistry) -> JoinHandle<()> {
    let mut events = queue.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Exhausted(item)) => match registry.get(&item.conversation_id) {
                    Some(session) => session.on_queue_exhausted(&item),
                    None => debug!(
                        conversation = %item.conversation_id,
                        queue_id = %item.id,
                        "No open session for exhausted entry"
                    ),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Queue event listener fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
