//! Connectivity observer.
//!
//! Holds the current online/offline state in a `tokio::sync::watch` cell and
//! runs subscriber callbacks on transitions only. Whoever knows about the
//! network (the realtime task's notifications, a platform reachability API)
//! feeds it through [`ConnectivityMonitor::set_connected`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current state. Returns `true` if this was a transition.
    pub fn set_connected(&self, connected: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
        if changed {
            info!(connected, "Connectivity changed");
        }
        changed
    }

    /// Run `callback` with the new state on every transition after this call.
    ///
    /// The callback runs on a spawned task, so this must be called from within
    /// a tokio runtime. It stops when the returned [`Subscription`] is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + 'static,
    {
        let mut rx = self.state.subscribe();
        let mut last = *rx.borrow_and_update();

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let now = *rx.borrow_and_update();
                // Two quick flips can coalesce into "no change".
                if now == last {
                    continue;
                }
                last = now;
                callback(now);
            }
        });

        debug!("Connectivity subscriber registered");
        Subscription { task }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Keeps a connectivity callback alive.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn set_connected_reports_transitions_only() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_connected());

        assert!(monitor.set_connected(true));
        assert!(!monitor.set_connected(true));
        assert!(monitor.is_connected());
        assert!(monitor.set_connected(false));
    }

    #[tokio::test]
    async fn subscriber_sees_each_transition() {
        let monitor = ConnectivityMonitor::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _sub = monitor.subscribe(move |connected| sink.lock().unwrap().push(connected));

        monitor.set_connected(true);
        settle().await;
        monitor.set_connected(true);
        settle().await;
        monitor.set_connected(false);
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_callbacks() {
        let monitor = ConnectivityMonitor::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let sub = monitor.subscribe(move |connected| sink.lock().unwrap().push(connected));
        sub.unsubscribe();
        settle().await;

        monitor.set_connected(true);
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
