// Transport layer: durable HTTP API, realtime websocket, connectivity.

pub mod api;
pub mod connectivity;
pub mod error;
pub mod presence;
pub mod realtime;

pub use api::{ChatApi, HttpChatApi, SendMessageRequest};
pub use connectivity::{ConnectivityMonitor, Subscription};
pub use error::{ApiError, RealtimeError};
pub use presence::PresenceTracker;
pub use realtime::{
    spawn_realtime, RealtimeChannel, RealtimeCommand, RealtimeConfig, RealtimeHandle,
    RealtimeNotification,
};
