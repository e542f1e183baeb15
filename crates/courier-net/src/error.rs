use thiserror::Error;

/// Failures of the durable request/response path.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request never produced a response (DNS, connect, timeout...).
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a status worth retrying (408, 429, 5xx).
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The server refused the request for good (validation, auth...).
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500..=599 => Self::Server { status, message },
            _ => Self::Rejected { status, message },
        }
    }

    /// Whether the same request may succeed later without modification.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        match e.status() {
            Some(status) => Self::from_status(status.as_u16(), e.to_string()),
            None => Self::Network(e.to_string()),
        }
    }
}

/// Failures of a non-blocking emit on the realtime channel.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Realtime channel is not connected")]
    NotConnected,

    #[error("Realtime command buffer is full")]
    ChannelFull,

    #[error("Realtime task has shut down")]
    Closed,
}
