use courier_net::ApiError;
use thiserror::Error;

/// Why a send delegate could not transmit a queued message.
#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Send handler panicked")]
    Panicked,

    #[error("Send handler owner has been dropped")]
    Detached,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Refusing to queue an empty message")]
    Empty,

    #[error("Offline queue is full ({0} entries)")]
    Full(usize),

    #[error("Queue entry not found: {0}")]
    NotFound(String),

    #[error("No send handler is attached")]
    NoHandler,

    #[error("Send failed: {0}")]
    Send(#[from] SendError),
}

/// Failures surfaced by [`ChatSession`](crate::ChatSession) actions.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The server refused the message; it was not queued.
    #[error("Message rejected: {0}")]
    Rejected(#[source] ApiError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Could not queue message: {0}")]
    Queue(#[from] QueueError),
}
