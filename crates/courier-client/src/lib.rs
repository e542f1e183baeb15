//! # courier-client
//!
//! Client-side message delivery engine. Each open conversation is a
//! [`ChatSession`] that sends optimistically over the realtime socket and
//! the HTTP API at once, reconciles server confirmations and receipts into
//! one message list, and falls back to the persistent
//! [`OfflineMessageQueue`] when neither path confirms a message.
//! [`ChatClient`] wires the sessions to one backend.

pub mod actions;
pub mod config;
pub mod error;
pub mod network;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod typing;

mod bridge;

#[cfg(test)]
pub(crate) mod test_support;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::{ClientConfig, QueueConfig};
pub use error::{QueueError, SendError, SessionError};
pub use queue::{FlushReport, OfflineMessageQueue, QueueEvent, QueueStats};
pub use registry::SessionRegistry;
pub use service::{ChatClient, ClientParts};
pub use session::{ChatSession, SessionContext};
pub use snapshot::SessionSnapshot;
pub use transport::{handler_fn, SendHandler, Transport};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Call once, early; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("courier_client=debug,courier_net=debug,courier_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
