//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the engine starts with zero
//! configuration against a local backend.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_BASE_DELAY_MS,
    QUEUE_RETENTION_SECS, TYPING_IDLE_MS,
};
use courier_shared::UserId;

/// Offline queue tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Automatic retries before an entry is left for manual retry.
    pub max_retries: u32,
    /// Backoff unit: the n-th failure re-flushes after `base_delay * n`.
    pub base_delay: Duration,
    /// Non-failed entries older than this are purged.
    pub retention: Duration,
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retention: Duration::from_secs(QUEUE_RETENTION_SECS),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl QueueConfig {
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.base_delay
            .checked_mul(retry_count)
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the durable HTTP API.
    /// Env: `COURIER_API_URL`
    /// Default: `http://localhost:3000/api`
    pub api_url: String,

    /// Realtime websocket endpoint.
    /// Env: `COURIER_REALTIME_URL`
    /// Default: `ws://localhost:3000/realtime`
    pub realtime_url: String,

    /// Bearer token for both paths.
    /// Env: `COURIER_AUTH_TOKEN`
    pub auth_token: Option<String>,

    /// The local user; decides which messages are "mine".
    /// Env: `COURIER_USER_ID`
    /// Default: `anonymous`
    pub user_id: UserId,

    /// SQLite file backing the offline queue.
    /// Env: `COURIER_QUEUE_DB`
    /// Default: platform data directory.
    pub queue_db_path: Option<PathBuf>,

    /// Env: `COURIER_QUEUE_MAX_RETRIES`, `COURIER_QUEUE_BASE_DELAY_MS`
    pub queue: QueueConfig,

    /// Env: `COURIER_TYPING_IDLE_MS`
    /// Default: 3000 ms
    pub typing_idle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/api".to_string(),
            realtime_url: "ws://localhost:3000/realtime".to_string(),
            auth_token: None,
            user_id: UserId::from("anonymous"),
            queue_db_path: None,
            queue: QueueConfig::default(),
            typing_idle: Duration::from_millis(TYPING_IDLE_MS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("COURIER_API_URL") {
            config.api_url = url;
        }

        if let Some(url) = lookup("COURIER_REALTIME_URL") {
            config.realtime_url = url;
        }

        config.auth_token = lookup("COURIER_AUTH_TOKEN").filter(|t| !t.is_empty());

        if let Some(user) = lookup("COURIER_USER_ID").filter(|u| !u.is_empty()) {
            config.user_id = UserId(user);
        }

        if let Some(path) = lookup("COURIER_QUEUE_DB") {
            config.queue_db_path = Some(PathBuf::from(path));
        }

        parse_into(&lookup, "COURIER_QUEUE_MAX_RETRIES", &mut config.queue.max_retries);

        let mut base_ms = config.queue.base_delay.as_millis() as u64;
        parse_into(&lookup, "COURIER_QUEUE_BASE_DELAY_MS", &mut base_ms);
        config.queue.base_delay = Duration::from_millis(base_ms);

        let mut typing_ms = config.typing_idle.as_millis() as u64;
        parse_into(&lookup, "COURIER_TYPING_IDLE_MS", &mut typing_ms);
        config.typing_idle = Duration::from_millis(typing_ms);

        config
    }
}

/// Overwrite `target` with the parsed variable; keep it on a bad value.
fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, target: &mut T)
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(e) => tracing::warn!(
            variable = name,
            value = %raw,
            error = %e,
            "Invalid value, using default"
        ),
    }
}
