/// Prefix of locally generated message ids
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Storage key under which the offline queue blob is persisted
pub const QUEUE_STORAGE_KEY: &str = "courier.offline_queue";

/// Queue entries older than this are purged (unless failed)
pub const QUEUE_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default automatic retry ceiling for a queued message
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default backoff unit; delay = base * retry_count
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;

/// A typing indicator without a "stop" event expires after this long
pub const TYPING_IDLE_MS: u64 = 3_000;

/// Initial / maximum realtime reconnect delay
pub const RECONNECT_DELAY_MS: u64 = 1_000;
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Capacity of the realtime command and notification channels
pub const REALTIME_CHANNEL_CAPACITY: usize = 256;

/// Entries the offline queue accepts before refusing new ones
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
