//! Cache module for storing API responses in memory and on durable storage
//!
//! This module provides a TTL-keyed store with per-key change notification, a
//! persistence adapter that survives process restarts, and a compact text codec
//! for persisted records. Storage failures degrade to cache misses and never
//! reach the caller.

pub mod codec;
mod persistence;
mod storage;
mod store;
mod sweeper;

pub use persistence::{PersistenceAdapter, Rejection, SaveOutcome};
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageError};
pub use store::{CacheEntry, CacheEvent, CacheStats, CachedData, KeyedStore, Subscription};
pub use sweeper::SweeperHandle;
