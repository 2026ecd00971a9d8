//! Cache configuration
//!
//! Holds the tunables shared by the store, the persistence adapter, and the
//! background sweeper.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

/// Schema version stamped on every entry written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// TTL applied when a request does not specify one
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Interval between active eviction sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound on the size of a storage budget probe
pub const DEFAULT_PROBE_LIMIT_BYTES: u64 = 64 * 1024;

/// When mutations are written to durable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Every `set`, `remove`, and expiry is written immediately. `flush` still
    /// writes a full snapshot, which rewrites the same records.
    #[default]
    WriteThrough,
    /// Nothing is written until `flush` (or `shutdown`) is called
    OnFlush,
}

/// Configuration for a keyed store and its persistence layer
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace prepended to every durable record identifier
    pub namespace: String,
    /// Version written into new entries; records with any other version are purged
    pub schema_version: u32,
    /// TTL used by [`KeyedStore::set_default`](crate::KeyedStore::set_default)
    pub default_ttl: Duration,
    /// Interval for the background eviction sweep
    pub sweep_interval: Duration,
    /// Persistence policy
    pub persist_mode: PersistMode,
    /// Maximum size of the probe written before a bulk save
    pub probe_limit_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "fetchstash".to_string(),
            schema_version: CURRENT_SCHEMA_VERSION,
            default_ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            persist_mode: PersistMode::default(),
            probe_limit_bytes: DEFAULT_PROBE_LIMIT_BYTES,
        }
    }
}

impl CacheConfig {
    /// Sets the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the schema version
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Sets the persistence policy
    pub fn with_persist_mode(mut self, mode: PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }

    /// Sets the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Returns the XDG-compliant cache directory (`~/.cache/fetchstash/` on Linux)
///
/// Returns `None` if no home directory can be determined.
pub fn default_cache_dir() -> Option<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "fetchstash")?;
    Some(project_dirs.cache_dir().to_path_buf())
}
