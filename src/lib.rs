//! fetchstash - client-side response cache
//!
//! A TTL-keyed store with per-key change notification, persisted across
//! restarts, fronted by a request coordinator that coalesces concurrent
//! identical requests and falls back to stale data when offline.

pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;

pub use cache::{CacheEvent, CacheStats, CachedData, FileStorage, KeyedStore, MemoryStorage};
pub use config::{CacheConfig, PersistMode, CURRENT_SCHEMA_VERSION};
pub use coordinator::{compose_key, Connectivity, NetworkStatus, RequestCoordinator, RequestOptions};
pub use error::CacheError;
pub use http::HttpFetcher;
