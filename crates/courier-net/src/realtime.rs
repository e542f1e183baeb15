//! Realtime socket with tokio mpsc command/notification pattern.
//!
//! The websocket lives in a dedicated tokio task. Callers talk to it through
//! a [`RealtimeHandle`] (commands in) and a receiver of
//! [`RealtimeNotification`]s (events out). The task reconnects on its own
//! and re-joins every conversation that was joined before the drop.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_shared::constants::{
    MAX_RECONNECT_DELAY_MS, REALTIME_CHANNEL_CAPACITY, RECONNECT_DELAY_MS,
};
use courier_shared::{ClientEvent, ConversationId, ProtocolError, ServerEvent};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::RealtimeError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the realtime task.
#[derive(Debug)]
pub enum RealtimeCommand {
    Emit(ClientEvent),
    Shutdown,
}

/// Notifications sent *from* the realtime task to the application.
#[derive(Debug, Clone)]
pub enum RealtimeNotification {
    Connected,
    Disconnected { reason: String },
    Event(ServerEvent),
}

pub struct RealtimeConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Sent as the `token` query parameter.
    pub auth_token: Option<String>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub channel_capacity: usize,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(MAX_RECONNECT_DELAY_MS),
            channel_capacity: REALTIME_CHANNEL_CAPACITY,
        }
    }

    fn connect_url(&self) -> String {
        match &self.auth_token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, sep, token)
            }
            None => self.url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// The socket half of the dual-path send, as seen by the delivery engine.
pub trait RealtimeChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Hand an event to the socket without waiting. Never blocks.
    ///
    /// `Ok` only means the event was accepted into the local outbound
    /// buffer. It says nothing about the frame reaching the server.
    fn emit(&self, event: ClientEvent) -> Result<(), RealtimeError>;
}

#[derive(Clone)]
pub struct RealtimeHandle {
    cmd_tx: mpsc::Sender<RealtimeCommand>,
    connected: Arc<AtomicBool>,
}

impl RealtimeHandle {
    /// Close the socket and stop reconnecting.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RealtimeCommand::Shutdown).await;
    }
}

impl RealtimeChannel for RealtimeHandle {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Join/leave are accepted while disconnected: they update the set of
    /// conversations re-joined on the next connect. Everything else needs a
    /// live socket.
    fn emit(&self, event: ClientEvent) -> Result<(), RealtimeError> {
        if !is_membership(&event) && !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        self.cmd_tx
            .try_send(RealtimeCommand::Emit(event))
            .map_err(|e| match e {
                TrySendError::Full(_) => RealtimeError::ChannelFull,
                TrySendError::Closed(_) => RealtimeError::Closed,
            })
    }
}

fn is_membership(event: &ClientEvent) -> bool {
    matches!(
        event,
        ClientEvent::JoinConversation { .. } | ClientEvent::LeaveConversation { .. }
    )
}

/// Record join/leave intent. Returns whether `event` was a membership event.
fn track_membership(joined: &mut HashSet<ConversationId>, event: &ClientEvent) -> bool {
    match event {
        ClientEvent::JoinConversation { conversation_id } => {
            joined.insert(conversation_id.clone());
            true
        }
        ClientEvent::LeaveConversation { conversation_id } => {
            joined.remove(conversation_id);
            true
        }
        _ => false,
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Spawn the realtime socket in a background tokio task.
///
/// Returns the command handle and the notification receiver. Must be called
/// from within a tokio runtime.
pub fn spawn_realtime(
    config: RealtimeConfig,
) -> (RealtimeHandle, mpsc::Receiver<RealtimeNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
    let (notif_tx, notif_rx) = mpsc::channel(config.channel_capacity);
    let connected = Arc::new(AtomicBool::new(false));

    let handle = RealtimeHandle {
        cmd_tx,
        connected: connected.clone(),
    };

    tokio::spawn(run(config, cmd_rx, notif_tx, connected));

    (handle, notif_rx)
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

async fn run(
    config: RealtimeConfig,
    mut cmd_rx: mpsc::Receiver<RealtimeCommand>,
    notif_tx: mpsc::Sender<RealtimeNotification>,
    connected: Arc<AtomicBool>,
) {
    let url = config.connect_url();
    let mut joined = HashSet::new();
    let mut delay = config.reconnect_delay;

    info!(url = %config.url, "Realtime task started");

    loop {
        let Some(result) = while_offline(connect_async(url.clone()), &mut joined, &mut cmd_rx).await
        else {
            break;
        };

        match result {
            Ok((socket, _response)) => {
                info!(url = %config.url, "Realtime connected");
                delay = config.reconnect_delay;

                let end =
                    run_session(socket, &mut joined, &mut cmd_rx, &notif_tx, &connected).await;
                connected.store(false, Ordering::SeqCst);

                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped(reason) => {
                        warn!(reason = %reason, "Realtime connection lost");
                        let _ = notif_tx
                            .send(RealtimeNotification::Disconnected { reason })
                            .await;
                    }
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Realtime connect failed"
                );
            }
        }

        if while_offline(tokio::time::sleep(delay), &mut joined, &mut cmd_rx)
            .await
            .is_none()
        {
            break;
        }
        delay = next_delay(delay, config.max_reconnect_delay);
    }

    connected.store(false, Ordering::SeqCst);
    info!("Realtime task terminated");
}

/// Drive `fut` while still draining commands. Membership changes are kept,
/// other events are dropped. Returns `None` on shutdown.
async fn while_offline<F: Future>(
    fut: F,
    joined: &mut HashSet<ConversationId>,
    cmd_rx: &mut mpsc::Receiver<RealtimeCommand>,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            cmd = cmd_rx.recv() => match cmd {
                Some(RealtimeCommand::Emit(event)) => {
                    if !track_membership(joined, &event) {
                        debug!(event = ?event, "Dropping realtime event while offline");
                    }
                }
                Some(RealtimeCommand::Shutdown) | None => {
                    info!("Realtime shutdown requested");
                    return None;
                }
            },
        }
    }
}

async fn run_session(
    socket: Socket,
    joined: &mut HashSet<ConversationId>,
    cmd_rx: &mut mpsc::Receiver<RealtimeCommand>,
    notif_tx: &mpsc::Sender<RealtimeNotification>,
    connected: &AtomicBool,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    for conversation_id in joined.iter() {
        let rejoin = ClientEvent::JoinConversation {
            conversation_id: conversation_id.clone(),
        };
        match rejoin.to_json() {
            Ok(text) => {
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    return SessionEnd::Dropped(e.to_string());
                }
                debug!(conversation = %conversation_id, "Re-joined conversation");
            }
            Err(e) => error!(error = %e, "Failed to encode join"),
        }
    }

    connected.store(true, Ordering::SeqCst);
    if notif_tx.send(RealtimeNotification::Connected).await.is_err() {
        return SessionEnd::Shutdown;
    }

    loop {
        tokio::select! {
            // --- Commands from the application ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RealtimeCommand::Emit(event)) => {
                        track_membership(joined, &event);
                        let text = match event.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                error!(error = %e, "Failed to encode realtime event");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            return SessionEnd::Dropped(e.to_string());
                        }
                        debug!(
                            conversation = %event.conversation_id(),
                            "Realtime event sent"
                        );
                    }
                    Some(RealtimeCommand::Shutdown) | None => {
                        info!("Realtime shutdown requested");
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                }
            }

            // --- Frames from the server ---
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_json(text.as_str()) {
                        Ok(event) => {
                            debug!(conversation = %event.conversation_id(), "Realtime event received");
                            if notif_tx.send(RealtimeNotification::Event(event)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed realtime event"),
                    },
                    Some(Ok(WsMessage::Binary(data))) => {
                        let e = ProtocolError::UnexpectedFrame(format!("binary, {} bytes", data.len()));
                        warn!(error = %e, "Ignoring realtime frame");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return SessionEnd::Dropped(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_shared::{DeliveryStatus, Message, MessageId, MessageKind, UserId};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn join(id: &str) -> ClientEvent {
        ClientEvent::JoinConversation {
            conversation_id: ConversationId::from(id),
        }
    }

    #[test]
    fn token_is_appended_as_query() {
        let mut config = RealtimeConfig::new("wss://rt.example.com/socket");
        assert_eq!(config.connect_url(), "wss://rt.example.com/socket");

        config.auth_token = Some("abc".into());
        assert_eq!(config.connect_url(), "wss://rt.example.com/socket?token=abc");

        config.url = "wss://rt.example.com/socket?v=2".into();
        assert_eq!(config.connect_url(), "wss://rt.example.com/socket?v=2&token=abc");
    }

    #[test]
    fn reconnect_delay_doubles_up_to_cap() {
        let max = Duration::from_secs(30);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..7 {
            delay = next_delay(delay, max);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn membership_tracking() {
        let mut joined = HashSet::new();
        assert!(track_membership(&mut joined, &join("a")));
        assert!(joined.contains(&ConversationId::from("a")));

        let typing = ClientEvent::Typing {
            conversation_id: ConversationId::from("a"),
            is_typing: true,
        };
        assert!(!track_membership(&mut joined, &typing));

        let leave = ClientEvent::LeaveConversation {
            conversation_id: ConversationId::from("a"),
        };
        assert!(track_membership(&mut joined, &leave));
        assert!(joined.is_empty());
    }

    #[test]
    fn emit_requires_connection_except_membership() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let handle = RealtimeHandle {
            cmd_tx,
            connected: Arc::new(AtomicBool::new(false)),
        };

        let mark = ClientEvent::MarkRead {
            conversation_id: ConversationId::from("a"),
        };
        assert!(matches!(handle.emit(mark), Err(RealtimeError::NotConnected)));

        handle.emit(join("a")).unwrap();
        assert!(matches!(
            handle.emit(join("b")),
            Err(RealtimeError::ChannelFull)
        ));

        cmd_rx.close();
        assert!(matches!(handle.emit(join("c")), Err(RealtimeError::Closed)));
    }

    #[tokio::test]
    async fn joins_and_receives_events_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            let text = first.into_text().unwrap().as_str().to_string();
            assert!(text.contains("join_conversation"));
            assert!(text.contains("\"conversationId\":\"c1\""));

            let message = Message {
                id: MessageId::from("m1"),
                conversation_id: ConversationId::from("c1"),
                sender_id: UserId::from("bob"),
                content: "hello".into(),
                kind: MessageKind::Text,
                created_at: Utc::now(),
                delivery_status: DeliveryStatus::Sent,
                read_by: Vec::new(),
                reply_to: None,
                correlation_id: None,
            };
            let event = serde_json::to_string(&ServerEvent::NewMessage(message)).unwrap();
            ws.send(WsMessage::Text(event.into())).await.unwrap();

            // Hold the socket open until the client hangs up.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (handle, mut notifications) = spawn_realtime(RealtimeConfig::new(format!("ws://{addr}")));
        handle.emit(join("c1")).unwrap();

        let first = timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, RealtimeNotification::Connected));
        assert!(handle.is_connected());

        let second = timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            RealtimeNotification::Event(ServerEvent::NewMessage(m)) => {
                assert_eq!(m.id, MessageId::from("m1"));
            }
            other => panic!("unexpected notification: {other:?}"),
        }

        handle.shutdown().await;
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }
}
