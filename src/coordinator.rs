//! Request coordination in front of a remote API
//!
//! [`RequestCoordinator`] wraps outbound fetches with cache-aside reads,
//! single-flight coalescing of concurrent identical requests, and offline
//! fallback to stale data.
//!
//! # Behavior
//! - A fresh cached value is returned without calling the executor
//! - A request for a key already in flight attaches to that operation
//! - Offline, any cached value (even expired) is returned as a degraded success
//! - Otherwise the executor runs once and its result populates the store

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};

use crate::cache::KeyedStore;
use crate::config::DEFAULT_TTL;
use crate::error::CacheError;

/// Reports whether the network is reachable
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Shareable online/offline flag
///
/// Clones share the same flag, so the host application can flip it from its
/// own connectivity monitoring.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<AtomicBool>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStatus {
    /// Creates a status that starts online
    pub fn new() -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates a status that starts offline
    pub fn offline() -> Self {
        let status = Self::new();
        status.set_online(false);
        status
    }

    /// Updates the flag
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for NetworkStatus {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Per-request options
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Return a fresh cached value instead of calling the executor
    pub use_cache: bool,
    /// TTL applied to a freshly fetched value
    pub ttl: Duration,
    /// Namespace prepended to the key
    pub key_prefix: Option<String>,
    /// On executor failure, return an expired cached value if one exists
    pub stale_on_error: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            ttl: DEFAULT_TTL,
            key_prefix: None,
            stale_on_error: false,
        }
    }
}

impl RequestOptions {
    /// Always call the executor (unless offline or already in flight)
    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Sets the TTL for the fetched value
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the key namespace
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Falls back to expired data when the executor fails
    pub fn with_stale_on_error(mut self) -> Self {
        self.stale_on_error = true;
        self
    }

    fn qualify(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }
}

/// Builds a cache key from an operation name and its parameters
///
/// Parameters are serialized as JSON, so structurally equal parameters map to
/// the same key.
pub fn compose_key<P: Serialize + ?Sized>(operation: &str, params: &P) -> String {
    match serde_json::to_string(params) {
        Ok(params) => format!("{}:{}", operation, params),
        Err(_) => operation.to_string(),
    }
}

type PendingOperation<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;
type PendingMap<T> = Arc<Mutex<HashMap<String, PendingOperation<T>>>>;

/// Deregisters a pending operation when the executor task ends, including on panic
struct PendingGuard<T> {
    pending: PendingMap<T>,
    key: String,
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Coordinates requests for values of type `T`
#[derive(Clone)]
pub struct RequestCoordinator<T> {
    store: Arc<KeyedStore<T>>,
    pending: PendingMap<T>,
    connectivity: Arc<dyn Connectivity>,
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a coordinator that always considers the network online
    pub fn new(store: Arc<KeyedStore<T>>) -> Self {
        Self::with_connectivity(store, Arc::new(NetworkStatus::new()))
    }

    /// Creates a coordinator with a custom connectivity source
    pub fn with_connectivity(store: Arc<KeyedStore<T>>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            connectivity,
        }
    }

    /// Returns the underlying store
    pub fn store(&self) -> &Arc<KeyedStore<T>> {
        &self.store
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingOperation<T>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetches the value for `key`, going through the cache
    ///
    /// # Returns
    /// * `Ok(T)` - A cached, coalesced, freshly fetched, or (offline) stale value
    /// * `Err(CacheError)` - The executor failed, or offline with nothing cached
    ///
    /// The executor runs on its own task. A caller that stops awaiting does not
    /// cancel it, and its result still populates the cache.
    pub async fn request<F, Fut>(
        &self,
        key: &str,
        executor: F,
        options: RequestOptions,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let key = options.qualify(key);
        let online = self.connectivity.is_online();

        if options.use_cache {
            // Expired entries must survive the lookup when they may be needed
            // as a fallback
            let cached = if online && !options.stale_on_error {
                self.store.get(&key)
            } else {
                self.store
                    .peek(&key)
                    .filter(|cached| !cached.is_expired)
                    .map(|cached| cached.data)
            };
            if let Some(value) = cached {
                tracing::debug!("Cache hit for '{}'", key);
                return Ok(value);
            }
        }

        let operation = {
            let mut pending = self.lock_pending();
            let existing = pending.get(&key).cloned();
            match existing {
                Some(operation) => {
                    tracing::debug!("Coalescing request for '{}'", key);
                    Some(operation)
                }
                None if !online => None,
                None => {
                    tracing::debug!("Cache miss for '{}', fetching", key);
                    let operation = self.spawn_operation(key.clone(), executor, options.ttl);
                    pending.insert(key.clone(), operation.clone());
                    Some(operation)
                }
            }
        };

        let Some(operation) = operation else {
            return self.offline_fallback(&key);
        };

        match operation.await {
            Ok(value) => Ok(value),
            Err(err) if options.stale_on_error => match self.store.peek(&key) {
                Some(stale) => {
                    tracing::warn!("Request for '{}' failed ({}), serving stale data", key, err);
                    Ok(stale.data)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Spawns the executor and wraps its result in a shareable future
    ///
    /// Called with the pending map locked, so the operation is registered
    /// before the task can deregister it.
    fn spawn_operation<F, Fut>(&self, key: String, executor: F, ttl: Duration) -> PendingOperation<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let store = self.store.clone();
        let guard = PendingGuard {
            pending: self.pending.clone(),
            key,
        };

        let task = tokio::spawn(async move {
            let result = executor().await;
            match &result {
                Ok(value) => store.set(&guard.key, value.clone(), ttl),
                Err(err) => tracing::warn!("Request for '{}' failed: {}", guard.key, err),
            }
            // Store is populated before the operation is deregistered, so a
            // caller arriving in between sees the fresh entry
            drop(guard);
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(CacheError::RequestFailed(format!(
                    "executor task failed: {}",
                    err
                ))),
            }
        }
        .boxed()
        .shared()
    }

    fn offline_fallback(&self, key: &str) -> Result<T, CacheError> {
        match self.store.peek(key) {
            Some(cached) => {
                if cached.is_expired {
                    tracing::warn!("Offline, serving stale data for '{}'", key);
                }
                Ok(cached.data)
            }
            None => Err(CacheError::OfflineNoCache {
                key: key.to_string(),
            }),
        }
    }

    /// Removes the cached value for `key`. An in-flight request is unaffected.
    pub fn invalidate(&self, key: &str) -> bool {
        self.store.remove(key)
    }

    /// Removes every cached value whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.store.remove_prefix(prefix)
    }

    /// Whether a request for `key` is in flight
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock_pending().contains_key(key)
    }

    /// Number of requests in flight
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }
}
