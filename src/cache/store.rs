//! In-memory TTL-keyed store with per-key change notification
//!
//! The store owns the authoritative view of cached values. Expired entries are
//! evicted lazily on `get`/`has` and actively by [`KeyedStore::sweep_expired`],
//! which the background sweeper calls on an interval. Durability is delegated
//! to an optional [`PersistenceAdapter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use super::persistence::{PersistenceAdapter, SaveOutcome};
use super::storage::StorageBackend;
use super::sweeper::SweeperHandle;
use crate::config::{CacheConfig, PersistMode};

/// Smallest TTL honored; keeps `expires_at` strictly after `created_at`
const MIN_TTL: Duration = Duration::from_millis(1);

/// A cached value with its lifetime metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    /// The cached value
    pub value: T,
    /// When the value was stored
    pub created_at: DateTime<Utc>,
    /// When the value stops being fresh
    pub expires_at: DateTime<Utc>,
    /// Schema version the entry was written under
    pub schema_version: u32,
}

impl<T> CacheEntry<T> {
    /// Creates an entry stamped with `now` that expires after `ttl`
    pub fn new(value: T, ttl: Duration, schema_version: u32) -> Self {
        let now = Utc::now();
        Self {
            value,
            created_at: now,
            expires_at: expiry_after(now, ttl),
            schema_version,
        }
    }

    /// Whether the entry has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl.max(MIN_TTL))
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of a non-evicting lookup, including metadata about freshness
#[derive(Debug, Clone)]
pub struct CachedData<T> {
    /// The cached value
    pub data: T,
    /// When the value was stored
    pub cached_at: DateTime<Utc>,
    /// When the value stops being fresh
    pub expires_at: DateTime<Utc>,
    /// Whether the entry has expired
    pub is_expired: bool,
}

/// A change to a single key, delivered to subscribers
#[derive(Debug, PartialEq)]
pub enum CacheEvent<'a, T> {
    /// A new value was stored
    Set(&'a T),
    /// The entry's expiry was renewed
    Refreshed,
    /// The entry was removed explicitly or by `clear`
    Removed,
    /// The entry was evicted after its TTL elapsed
    Expired,
}

impl<T> Clone for CacheEvent<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CacheEvent<'_, T> {}

type Listener<T> = Arc<dyn Fn(&str, CacheEvent<'_, T>) + Send + Sync>;

struct ListenerRegistry<T> {
    next_id: AtomicU64,
    by_key: Mutex<HashMap<String, Vec<(u64, Listener<T>)>>>,
}

impl<T> ListenerRegistry<T> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            by_key: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Listener<T>)>>> {
        self.by_key.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, key: &str, id: u64) {
        let mut by_key = self.lock();
        if let Some(listeners) = by_key.get_mut(key) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.is_empty() {
                by_key.remove(key);
            }
        }
    }

    fn notify(&self, key: &str, event: CacheEvent<'_, T>) {
        // Clone the handles out so listeners run without the lock held and may
        // subscribe or unsubscribe themselves
        let listeners: Vec<Listener<T>> = match self.lock().get(key) {
            Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };
        for listener in listeners {
            listener(key, event);
        }
    }
}

/// Handle for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription<T> {
    id: u64,
    key: String,
    registry: std::sync::Weak<ListenerRegistry<T>>,
}

impl<T> Subscription<T> {
    /// Key this subscription listens to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Deregisters the listener
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }
}

/// Counters describing store activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries currently held (may include not-yet-swept expired ones)
    pub entries: usize,
    /// Reads that found a fresh entry
    pub hits: u64,
    /// Reads that found nothing fresh
    pub misses: u64,
    /// Entries evicted after their TTL elapsed
    pub expirations: u64,
}

/// Thread-safe, TTL-keyed cache of values of a single type
///
/// Construct one per cached resource type and share it with `Arc`.
pub struct KeyedStore<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    listeners: Arc<ListenerRegistry<T>>,
    persistence: Option<PersistenceAdapter>,
    config: CacheConfig,
    /// Serializes durable writes so storage sees mutations in memory order.
    /// Always taken before `entries`, never while holding it.
    io: Mutex<()>,
    sweeper: Mutex<Option<SweeperHandle>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl<T> std::fmt::Debug for KeyedStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedStore")
            .field("namespace", &self.config.namespace)
            .field("entries", &self.entries.lock().map(|e| e.len()).unwrap_or(0))
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

/// State of a key found during a lookup
enum Outcome {
    Fresh,
    Expired,
    Missing,
}

impl<T> KeyedStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a store that lives only in memory
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a store backed by a durable medium
    ///
    /// Call [`init`](Self::init) to load previously persisted entries.
    pub fn with_storage(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let adapter = PersistenceAdapter::new(
            backend,
            config.namespace.clone(),
            config.schema_version,
            config.probe_limit_bytes,
        );
        Self::build(config, Some(adapter))
    }

    fn build(config: CacheConfig, persistence: Option<PersistenceAdapter>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            persistence,
            config,
            io: Mutex::new(()),
            sweeper: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Returns the store's configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_io(&self) -> MutexGuard<'_, ()> {
        self.io.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_through(&self) -> Option<&PersistenceAdapter> {
        match self.config.persist_mode {
            PersistMode::WriteThrough => self.persistence.as_ref(),
            PersistMode::OnFlush => None,
        }
    }

    /// Loads every valid persisted entry into memory
    ///
    /// Entries already in memory take precedence over persisted ones. Returns the
    /// number of entries loaded.
    pub fn init(&self) -> usize {
        let Some(persistence) = &self.persistence else {
            return 0;
        };

        let loaded = persistence.load_all::<T>();
        let mut entries = self.lock_entries();
        let mut count = 0;
        for (key, entry) in loaded {
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(key) {
                slot.insert(entry);
                count += 1;
            }
        }
        tracing::info!(
            "Restored {} cache entries under '{}'",
            count,
            self.config.namespace
        );
        count
    }

    /// Writes a full snapshot of live entries to durable storage
    pub fn flush(&self) -> Option<SaveOutcome> {
        let persistence = self.persistence.as_ref()?;
        let _io = self.lock_io();
        let snapshot = self.lock_entries().clone();
        Some(persistence.save_all(&snapshot))
    }

    /// Stops the background sweeper, if running, and flushes
    pub fn shutdown(&self) -> Option<SaveOutcome> {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
        let outcome = self.flush();
        tracing::info!("Cache '{}' shut down", self.config.namespace);
        outcome
    }

    /// Starts the background sweeper at the configured interval
    ///
    /// Must be called from within a tokio runtime. Replaces any running sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let handle = SweeperHandle::spawn(Arc::downgrade(self), self.config.sweep_interval);
        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.shutdown();
        }
    }

    /// Classifies the entry for `key`, evicting it from memory if expired
    fn evict_if_stale(&self, entries: &mut HashMap<String, CacheEntry<T>>, key: &str) -> Outcome {
        match entries.get(key) {
            None => Outcome::Missing,
            Some(entry) if entry.is_expired_at(Utc::now()) => {
                entries.remove(key);
                Outcome::Expired
            }
            Some(_) => Outcome::Fresh,
        }
    }

    /// Deletes the stored records of evicted keys that are still absent
    ///
    /// Called without the entries lock held. A key set again since its
    /// eviction keeps the newer record.
    fn forget_persisted(&self, keys: &[String]) {
        let Some(persistence) = self.write_through() else {
            return;
        };
        if keys.is_empty() {
            return;
        }
        let _io = self.lock_io();
        let gone: Vec<&String> = {
            let entries = self.lock_entries();
            keys.iter().filter(|key| !entries.contains_key(*key)).collect()
        };
        for key in gone {
            persistence.remove_one(key);
        }
    }

    /// Finishes a read: updates counters, drops the stored record and notifies on expiry
    fn after_read(&self, key: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Fresh => {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Expired => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache entry '{}' expired", key);
                self.forget_persisted(&[key.to_string()]);
                self.listeners.notify(key, CacheEvent::Expired);
            }
            Outcome::Missing => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns the value if present and unexpired
    ///
    /// An expired entry is deleted, its listeners notified, and `None` returned.
    pub fn get(&self, key: &str) -> Option<T> {
        let (outcome, value) = {
            let mut entries = self.lock_entries();
            let outcome = self.evict_if_stale(&mut entries, key);
            let value = match outcome {
                Outcome::Fresh => entries.get(key).map(|e| e.value.clone()),
                _ => None,
            };
            (outcome, value)
        };
        self.after_read(key, &outcome);
        value
    }

    /// Whether a fresh entry exists. Evicts like [`get`](Self::get).
    pub fn has(&self, key: &str) -> bool {
        let outcome = {
            let mut entries = self.lock_entries();
            self.evict_if_stale(&mut entries, key)
        };
        self.after_read(key, &outcome);
        matches!(outcome, Outcome::Fresh)
    }

    /// Returns the entry for `key` regardless of freshness, without evicting it
    pub fn peek(&self, key: &str) -> Option<CachedData<T>> {
        let entries = self.lock_entries();
        let entry = entries.get(key)?;
        Some(CachedData {
            data: entry.value.clone(),
            cached_at: entry.created_at,
            expires_at: entry.expires_at,
            is_expired: entry.is_expired_at(Utc::now()),
        })
    }

    /// Stores `value` under `key` for `ttl`, replacing any prior entry
    pub fn set(&self, key: &str, value: T, ttl: Duration) {
        let entry = CacheEntry::new(value.clone(), ttl, self.config.schema_version);
        match self.write_through() {
            Some(persistence) => {
                let _io = self.lock_io();
                self.lock_entries().insert(key.to_string(), entry.clone());
                persistence.save_one(key, &entry);
            }
            None => {
                self.lock_entries().insert(key.to_string(), entry);
            }
        }
        self.listeners.notify(key, CacheEvent::Set(&value));
    }

    /// Stores `value` under `key` with the configured default TTL
    pub fn set_default(&self, key: &str, value: T) {
        self.set(key, value, self.config.default_ttl);
    }

    /// Removes the entry for `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let _io = self.lock_io();
            let removed = self.lock_entries().remove(key).is_some();
            if let Some(persistence) = self.write_through() {
                persistence.remove_one(key);
            }
            removed
        };
        if removed {
            self.listeners.notify(key, CacheEvent::Removed);
        }
        removed
    }

    /// Removes every entry whose key starts with `prefix`. Returns the count.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let removed: Vec<String> = {
            let _io = self.lock_io();
            let keys: Vec<String> = {
                let mut entries = self.lock_entries();
                let keys: Vec<String> = entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                for key in &keys {
                    entries.remove(key);
                }
                keys
            };
            if let Some(persistence) = self.write_through() {
                for key in &keys {
                    persistence.remove_one(key);
                }
            }
            keys
        };
        for key in &removed {
            self.listeners.notify(key, CacheEvent::Removed);
        }
        removed.len()
    }

    /// Removes every entry
    pub fn clear(&self) {
        let removed: Vec<String> = {
            let _io = self.lock_io();
            let keys = self.lock_entries().drain().map(|(key, _)| key).collect();
            if let Some(persistence) = self.write_through() {
                persistence.clear();
            }
            keys
        };
        for key in &removed {
            self.listeners.notify(key, CacheEvent::Removed);
        }
    }

    /// Renews the expiry of a fresh entry to `now + ttl`
    ///
    /// Returns `false` if there is no fresh entry for `key`.
    pub fn update_expiry(&self, key: &str, ttl: Duration) -> bool {
        let outcome = {
            let _io = self.lock_io();
            let (outcome, renewed) = {
                let mut entries = self.lock_entries();
                let outcome = self.evict_if_stale(&mut entries, key);
                let renewed = match (&outcome, entries.get_mut(key)) {
                    (Outcome::Fresh, Some(entry)) => {
                        entry.expires_at = expiry_after(Utc::now(), ttl);
                        Some(entry.clone())
                    }
                    _ => None,
                };
                (outcome, renewed)
            };
            if let Some(persistence) = self.write_through() {
                match (&outcome, renewed) {
                    (Outcome::Fresh, Some(entry)) => persistence.save_one(key, &entry),
                    (Outcome::Expired, _) => persistence.remove_one(key),
                    _ => {}
                }
            }
            outcome
        };

        match outcome {
            Outcome::Fresh => {
                self.listeners.notify(key, CacheEvent::Refreshed);
                true
            }
            Outcome::Expired => {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.listeners.notify(key, CacheEvent::Expired);
                false
            }
            Outcome::Missing => false,
        }
    }

    /// Removes every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut expired = Vec::new();
        self.lock_entries().retain(|key, entry| {
            if entry.is_expired_at(now) {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });
        self.forget_persisted(&expired);

        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        for key in &expired {
            self.listeners.notify(key, CacheEvent::Expired);
        }
        if !expired.is_empty() {
            tracing::debug!(
                "Swept {} expired entries from '{}'",
                expired.len(),
                self.config.namespace
            );
        }
        expired.len()
    }

    /// Registers `listener` for changes to `key`
    ///
    /// The listener runs synchronously on the thread performing the mutation.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription<T>
    where
        F: Fn(&str, CacheEvent<'_, T>) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            key: key.to_string(),
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Keys currently held, including expired entries not yet evicted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Returns activity counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
