//! The durable side of the offline queue.
//!
//! [`QueueStore`] is the whole contract the queue relies on: read every
//! entry back on start-up, overwrite the full list after a mutation. Both
//! are awaited so a store backed by blocking I/O never stalls the runtime.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_shared::constants::QUEUE_STORAGE_KEY;
use courier_shared::QueuedMessage;
use tracing::debug;

use crate::database::Database;
use crate::error::{Result, StoreError};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Load every persisted entry, in enqueue order. A store that has never
    /// been written returns an empty list.
    async fn load(&self) -> Result<Vec<QueuedMessage>>;

    /// Replace the persisted queue with `items`.
    async fn save(&self, items: &[QueuedMessage]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// Persists the queue as one JSON blob under a fixed key. SQLite calls run
/// on the blocking thread pool.
pub struct SqliteQueueStore {
    db: Arc<Database>,
    key: String,
}

impl SqliteQueueStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_key(db, QUEUE_STORAGE_KEY)
    }

    pub fn with_key(db: Arc<Database>, key: impl Into<String>) -> Self {
        Self {
            db,
            key: key.into(),
        }
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn load(&self) -> Result<Vec<QueuedMessage>> {
        let db = self.db.clone();
        let key = self.key.clone();
        let blob = tokio::task::spawn_blocking(move || db.get_value(&key)).await??;

        let items = match blob {
            Some(blob) => serde_json::from_str(&blob)?,
            None => Vec::new(),
        };
        debug!(key = %self.key, count = items.len(), "Loaded persisted queue");
        Ok(items)
    }

    async fn save(&self, items: &[QueuedMessage]) -> Result<()> {
        let blob = serde_json::to_string(items)?;
        let db = self.db.clone();
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || db.set_value(&key, &blob)).await??;
        debug!(key = %self.key, count = items.len(), "Persisted queue");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-lifetime store, used by tests and when no data directory exists.
#[derive(Default)]
pub struct MemoryQueueStore {
    items: Mutex<Vec<QueuedMessage>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store as if a previous process had saved `items`.
    pub fn with_items(items: Vec<QueuedMessage>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<QueuedMessage>> {
        Ok(self.items.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }

    async fn save(&self, items: &[QueuedMessage]) -> Result<()> {
        *self.items.lock().map_err(|_| StoreError::Poisoned)? = items.to_vec();
        Ok(())
    }
}
