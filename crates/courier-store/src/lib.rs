//! # courier-store
//!
//! Durable persistence for the offline message queue.
//!
//! The store is deliberately small: a SQLite-backed, string-keyed value
//! table ([`Database`]) and the [`QueueStore`] pair of operations (`load` /
//! `save`) the queue calls on start-up and after every mutation. The whole
//! queue is written as one JSON blob, so a save is a single upsert.

pub mod database;
pub mod kv;
pub mod migrations;
pub mod queue_store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use queue_store::{MemoryQueueStore, QueueStore, SqliteQueueStore};
