//! Persistence adapter between the in-memory store and a durable medium
//!
//! Every failure at this boundary (corrupt records, storage pressure, I/O) is
//! logged and absorbed. Callers only ever observe a cache miss.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::codec;
use super::storage::{StorageBackend, StorageError};
use super::store::CacheEntry;

/// Identifier suffix for the storage budget probe. Sits outside the record
/// prefix so a leftover probe is never mistaken for a record.
const PROBE_SUFFIX: &str = ".__probe__";

/// Escapes `:` in a namespace so the first `:` of a record id always ends it
fn escape_namespace(namespace: &str) -> String {
    namespace.replace('%', "%25").replace(':', "%3A")
}

/// On-disk shape of a cache record
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord<D> {
    data: D,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expires_at: DateTime<Utc>,
    version: u32,
}

/// Why a persisted record was dropped during load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The record could not be decoded
    Corrupt,
    /// The record was written under a different schema version
    VersionMismatch { found: u32, expected: u32 },
    /// The record's TTL had already elapsed
    Expired,
}

/// Result of a bulk save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Records were written and stale records removed
    Saved { written: usize, removed: usize },
    /// The medium had no budget; nothing was written
    Skipped,
}

/// Reads and writes cache records under a namespace in a [`StorageBackend`]
#[derive(Clone)]
pub struct PersistenceAdapter {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
    /// Namespace as it appears in record ids
    scope: String,
    schema_version: u32,
    probe_limit_bytes: u64,
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("namespace", &self.namespace)
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

impl PersistenceAdapter {
    /// Creates an adapter for records under `namespace`
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        namespace: impl Into<String>,
        schema_version: u32,
        probe_limit_bytes: u64,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            backend,
            scope: escape_namespace(&namespace),
            namespace,
            schema_version,
            probe_limit_bytes,
        }
    }

    fn prefix(&self) -> String {
        format!("{}:", self.scope)
    }

    fn record_id(&self, key: &str) -> String {
        format!("{}:{}", self.scope, key)
    }

    /// Loads every valid record under the namespace
    ///
    /// Records that fail to decode, carry another schema version, or have
    /// expired are removed from storage. A bad record never aborts the scan.
    pub fn load_all<T: DeserializeOwned>(&self) -> HashMap<String, CacheEntry<T>> {
        let prefix = self.prefix();
        let ids = match self.backend.list(&prefix) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("Failed to list cache records under '{}': {}", prefix, e);
                return HashMap::new();
            }
        };

        let now = Utc::now();
        let mut entries = HashMap::new();
        for id in ids {
            let Some(key) = id.strip_prefix(&prefix) else {
                continue;
            };

            let text = match self.backend.read(&id) {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Failed to read cache record '{}': {}", id, e);
                    continue;
                }
            };

            match self.decode_record(&text, now) {
                Ok(entry) => {
                    entries.insert(key.to_string(), entry);
                }
                Err(rejection) => {
                    match &rejection {
                        Rejection::Corrupt => {
                            tracing::warn!("Dropping corrupt cache record '{}'", id)
                        }
                        Rejection::VersionMismatch { found, expected } => tracing::debug!(
                            "Dropping cache record '{}' with version {} (expected {})",
                            id,
                            found,
                            expected
                        ),
                        Rejection::Expired => {
                            tracing::debug!("Dropping expired cache record '{}'", id)
                        }
                    }
                    self.remove_id(&id);
                }
            }
        }

        tracing::debug!("Loaded {} cache records under '{}'", entries.len(), prefix);
        entries
    }

    /// Decodes and validates a single persisted record
    pub fn decode_record<T: DeserializeOwned>(
        &self,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry<T>, Rejection> {
        // Decode the envelope first so a payload shape change under a new
        // schema version is reported as a version mismatch
        let record: PersistedRecord<serde_json::Value> =
            codec::decompress(text).ok_or(Rejection::Corrupt)?;

        if record.version != self.schema_version {
            return Err(Rejection::VersionMismatch {
                found: record.version,
                expected: self.schema_version,
            });
        }
        if record.expires_at <= record.timestamp {
            return Err(Rejection::Corrupt);
        }
        if record.expires_at <= now {
            return Err(Rejection::Expired);
        }

        let value = serde_json::from_value(record.data).map_err(|_| Rejection::Corrupt)?;
        Ok(CacheEntry {
            value,
            created_at: record.timestamp,
            expires_at: record.expires_at,
            schema_version: record.version,
        })
    }

    fn encode_record<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) -> Option<String> {
        let record = PersistedRecord {
            data: &entry.value,
            timestamp: entry.created_at,
            expires_at: entry.expires_at,
            version: entry.schema_version,
        };
        match codec::compress(&record) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("Failed to encode cache record '{}': {}", key, e);
                None
            }
        }
    }

    /// Writes a single entry. Expired or out-of-version entries are removed instead.
    pub fn save_one<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) {
        if entry.schema_version != self.schema_version || entry.is_expired_at(Utc::now()) {
            self.remove_one(key);
            return;
        }

        let Some(text) = self.encode_record(key, entry) else {
            return;
        };
        self.write_id(&self.record_id(key), &text);
    }

    /// Removes a single record
    pub fn remove_one(&self, key: &str) {
        self.remove_id(&self.record_id(key));
    }

    /// Writes a full snapshot of the live entries
    ///
    /// Checks the medium's budget with a bounded trial write first and skips the
    /// whole save if it fails. Records under the namespace that are not part of
    /// the snapshot are removed.
    pub fn save_all<T: Serialize>(&self, entries: &HashMap<String, CacheEntry<T>>) -> SaveOutcome {
        let now = Utc::now();
        let encoded: Vec<(String, String)> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.schema_version == self.schema_version && !entry.is_expired_at(now)
            })
            .filter_map(|(key, entry)| {
                self.encode_record(key, entry)
                    .map(|text| (self.record_id(key), text))
            })
            .collect();

        let estimated = self.growth(&encoded);
        if !self.has_budget(estimated) {
            tracing::warn!(
                "Skipping cache save under '{}': storage has no room for ~{} bytes",
                self.namespace,
                estimated
            );
            return SaveOutcome::Skipped;
        }

        let mut written = 0;
        for (id, text) in &encoded {
            if self.write_id(id, text) {
                written += 1;
            }
        }

        let mut removed = 0;
        match self.backend.list(&self.prefix()) {
            Ok(ids) => {
                for id in ids {
                    if !encoded.iter().any(|(live, _)| *live == id) && self.remove_id(&id) {
                        removed += 1;
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to list cache records for cleanup: {}", e),
        }

        tracing::debug!(
            "Saved {} cache records under '{}', removed {}",
            written,
            self.namespace,
            removed
        );
        SaveOutcome::Saved { written, removed }
    }

    /// Removes every record under the namespace
    pub fn clear(&self) {
        match self.backend.list(&self.prefix()) {
            Ok(ids) => {
                for id in ids {
                    self.remove_id(&id);
                }
            }
            Err(e) => tracing::warn!("Failed to list cache records for clearing: {}", e),
        }
    }

    /// Bytes the snapshot adds on top of the records it overwrites
    fn growth(&self, encoded: &[(String, String)]) -> u64 {
        encoded
            .iter()
            .map(|(id, text)| {
                let current = match self.backend.size(id) {
                    Ok(size) => size.unwrap_or(0),
                    Err(e) => {
                        tracing::debug!("Failed to size cache record '{}': {}", id, e);
                        0
                    }
                };
                (text.len() as u64).saturating_sub(current)
            })
            .sum()
    }

    /// Estimates whether the medium can take `estimated_bytes` more data
    fn has_budget(&self, estimated_bytes: u64) -> bool {
        let probe_len = estimated_bytes.min(self.probe_limit_bytes) as usize;
        if probe_len == 0 {
            return true;
        }

        let probe_id = format!("{}{}", self.scope, PROBE_SUFFIX);
        let result = self.backend.write(&probe_id, &"0".repeat(probe_len));
        self.remove_id(&probe_id);

        match result {
            Ok(()) => true,
            Err(StorageError::QuotaExceeded { .. }) => false,
            Err(e) => {
                tracing::warn!("Storage probe failed: {}", e);
                false
            }
        }
    }

    fn write_id(&self, id: &str, text: &str) -> bool {
        match self.backend.write(id, text) {
            Ok(()) => true,
            Err(StorageError::QuotaExceeded { needed, limit }) => {
                tracing::warn!(
                    "Skipping write of '{}': quota exceeded ({} > {} bytes)",
                    id,
                    needed,
                    limit
                );
                false
            }
            Err(e) => {
                tracing::warn!("Failed to write cache record '{}': {}", id, e);
                false
            }
        }
    }

    fn remove_id(&self, id: &str) -> bool {
        match self.backend.remove(id) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to remove cache record '{}': {}", id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::{FileStorage, MemoryStorage};
    use chrono::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        name: String,
        value: i32,
    }

    fn entry(value: i32, ttl: Duration, version: u32) -> CacheEntry<TestData> {
        let now = Utc::now();
        CacheEntry {
            value: TestData {
                name: format!("item-{}", value),
                value,
            },
            created_at: now,
            expires_at: now + ttl,
            schema_version: version,
        }
    }

    fn adapter(backend: Arc<dyn StorageBackend>) -> PersistenceAdapter {
        PersistenceAdapter::new(backend, "test", 1, 64 * 1024)
    }

    #[test]
    fn test_save_one_then_load_all() {
        let backend = Arc::new(MemoryStorage::new());
        let adapter = adapter(backend.clone());

        adapter.save_one("user:1", &entry(1, Duration::hours(1), 1));

        let loaded: HashMap<String, CacheEntry<TestData>> = adapter.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["user:1"].value.value, 1);
        assert!(backend.read("test:user:1").unwrap().is_some());
    }

    #[test]
    fn test_persisted_record_shape() {
        let backend = Arc::new(MemoryStorage::new());
        let adapter = adapter(backend.clone());
        adapter.save_one("user:1", &entry(5, Duration::hours(1), 1));

        let text = backend.read("test:user:1").unwrap().unwrap();
        let raw: serde_json::Value = codec::decompress(&text).unwrap();

        assert_eq!(raw["data"]["value"], 5);
        assert_eq!(raw["version"], 1);
        assert!(raw["timestamp"].is_i64());
        assert!(raw["expiresAt"].as_i64().unwrap() > raw["timestamp"].as_i64().unwrap());
    }

    #[test]
    fn test_load_all_drops_old_version_and_removes_record() {
        let backend = Arc::new(MemoryStorage::new());
        let old = PersistenceAdapter::new(backend.clone(), "test", 0, 1024);
        old.save_one("user:1", &entry(1, Duration::hours(1), 0));
        assert!(backend.read("test:user:1").unwrap().is_some());

        let loaded: HashMap<String, CacheEntry<TestData>> = adapter(backend.clone()).load_all();

        assert!(loaded.is_empty());
        assert!(backend.read("test:user:1").unwrap().is_none());
    }

    #[test]
    fn test_load_all_drops_corrupt_record_without_aborting() {
        let backend = Arc::new(MemoryStorage::new());
        let adapter = adapter(backend.clone());
        adapter.save_one("good:1", &entry(1, Duration::hours(1), 1));
        backend.write("test:bad:1", "%%% not a record %%%").unwrap();
        adapter.save_one("good:2", &entry(2, Duration::hours(1), 1));

        let loaded: HashMap<String, CacheEntry<TestData>> = adapter.load_all();

        assert_eq!(loaded.len(), 2);
        assert!(backend.read("test:bad:1").unwrap().is_none());
    }

    #[test]
    fn test_load_all_drops_expired_record() {
        let backend = Arc::new(MemoryStorage::new());
        let adapter = adapter(backend.clone());
        let mut expired = entry(1, Duration::hours(1), 1);
        expired.created_at = Utc::now() - Duration::hours(2);
        expired.expires_at = Utc::now() - Duration::hours(1);
        // save_one refuses expired entries, so write the record directly
        let text = adapter.encode_record("old", &expired).unwrap();
        backend.write("test:old", &text).unwrap();

        let loaded: HashMap<String, CacheEntry<TestData>> = adapter.load_all();

        assert!(loaded.is_empty());
        assert!(backend.read("test:old").unwrap().is_none());
    }

    #[test]
    fn test_load_all_accepts_legacy_uncompressed_record() {
        let backend = Arc::new(MemoryStorage::new());
        let expires = (Utc::now() + Duration::hours(1)).timestamp_millis();
        let legacy = format!(
            r#"{{"data":{{"name":"legacy","value":9}},"timestamp":{},"expiresAt":{},"version":1}}"#,
            Utc::now().timestamp_millis() - 1,
            expires
        );
        backend.write("test:legacy", &legacy).unwrap();

        let loaded: HashMap<String, CacheEntry<TestData>> = adapter(backend).load_all();

        assert_eq!(loaded["legacy"].value.name, "legacy");
    }

    #[test]
    fn test_load_all_ignores_other_namespaces() {
        let backend = Arc::new(MemoryStorage::new());
        let other = PersistenceAdapter::new(backend.clone(), "other", 1, 1024);
        other.save_one("user:1", &entry(1, Duration::hours(1), 1));

        let loaded: HashMap<String, CacheEntry<TestData>> = adapter(backend.clone()).load_all();

        assert!(loaded.is_empty());
        assert!(backend.read("other:user:1").unwrap().is_some());
    }

    #[test]
    fn test_save_all_skips_under_storage_pressure() {
        let backend = Arc::new(MemoryStorage::with_quota(64));
        let adapter = adapter(backend.clone());
        let mut entries = HashMap::new();
        for i in 0..10 {
            entries.insert(format!("item:{}", i), entry(i, Duration::hours(1), 1));
        }

        let outcome = adapter.save_all(&entries);

        assert_eq!(outcome, SaveOutcome::Skipped);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_save_one_over_quota_is_silent() {
        let backend = Arc::new(MemoryStorage::with_quota(8));
        let adapter = adapter(backend.clone());

        adapter.save_one("big", &entry(1, Duration::hours(1), 1));

        assert!(backend.is_empty());
    }

    #[test]
    fn test_save_all_writes_live_and_removes_stale_records() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend = Arc::new(FileStorage::new(temp_dir.path()));
        let adapter = adapter(backend.clone());
        adapter.save_one("gone", &entry(0, Duration::hours(1), 1));

        let mut entries = HashMap::new();
        entries.insert("a".to_string(), entry(1, Duration::hours(1), 1));
        entries.insert("b".to_string(), entry(2, Duration::hours(1), 1));
        let mut expired = entry(3, Duration::hours(1), 1);
        expired.expires_at = Utc::now() - Duration::seconds(1);
        expired.created_at = expired.expires_at - Duration::seconds(1);
        entries.insert("c".to_string(), expired);

        let outcome = adapter.save_all(&entries);

        assert_eq!(outcome, SaveOutcome::Saved { written: 2, removed: 1 });
        assert_eq!(backend.list("test:").unwrap(), vec!["test:a", "test:b"]);
        // The budget probe leaves nothing behind
        assert_eq!(backend.list("").unwrap().len(), 2);
    }

    #[test]
    fn test_clear_removes_namespace_only() {
        let backend = Arc::new(MemoryStorage::new());
        let adapter = adapter(backend.clone());
        adapter.save_one("a", &entry(1, Duration::hours(1), 1));
        backend.write("unrelated", "x").unwrap();

        adapter.clear();

        assert_eq!(backend.list("").unwrap(), vec!["unrelated"]);
    }

    #[test]
    fn test_namespaces_sharing_a_prefix_stay_separate() {
        let backend = Arc::new(MemoryStorage::new());
        let users = PersistenceAdapter::new(backend.clone(), "app:users", 1, 1024);
        let app = PersistenceAdapter::new(backend.clone(), "app", 1, 1024);
        users.save_one("1", &entry(1, Duration::hours(1), 1));

        let loaded: HashMap<String, CacheEntry<TestData>> = app.load_all();
        assert!(loaded.is_empty());

        let mut entries = HashMap::new();
        entries.insert("x".to_string(), entry(2, Duration::hours(1), 1));
        assert_eq!(
            app.save_all(&entries),
            SaveOutcome::Saved { written: 1, removed: 0 }
        );
        app.clear();

        let loaded: HashMap<String, CacheEntry<TestData>> = users.load_all();
        assert_eq!(loaded["1"].value.value, 1);
        assert_eq!(backend.list("").unwrap(), vec!["app%3Ausers:1"]);
    }

    #[test]
    fn test_save_all_replacing_records_needs_only_net_growth() {
        let mut entries = HashMap::new();
        entries.insert("k".to_string(), entry(1, Duration::hours(1), 1));

        // Size one record, then allow room for it plus a little slack
        let sizing = Arc::new(MemoryStorage::new());
        adapter(sizing.clone()).save_all(&entries);
        let record_len = sizing.read("test:k").unwrap().unwrap().len() as u64;

        let backend = Arc::new(MemoryStorage::with_quota(record_len + record_len / 2));
        let adapter = adapter(backend.clone());
        assert_eq!(
            adapter.save_all(&entries),
            SaveOutcome::Saved { written: 1, removed: 0 }
        );

        entries.insert("k".to_string(), entry(2, Duration::hours(1), 1));
        assert_eq!(
            adapter.save_all(&entries),
            SaveOutcome::Saved { written: 1, removed: 0 }
        );

        let loaded: HashMap<String, CacheEntry<TestData>> = adapter.load_all();
        assert_eq!(loaded["k"].value.value, 2);
    }
}
