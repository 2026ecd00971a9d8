//! Durable key-value media for persisted cache records
//!
//! A [`StorageBackend`] stores opaque text records under string identifiers.
//! [`FileStorage`] keeps one file per record in a directory; [`MemoryStorage`]
//! keeps records in process and is mostly useful for tests. Both can enforce a
//! byte quota so storage pressure can be exercised deterministically.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// File extension for records named by their encoded identifier
const RECORD_EXTENSION: &str = "rec";

/// File extension for records named by a hash of their identifier
const HASHED_EXTENSION: &str = "hrec";

/// Longest encoded identifier used directly as a file name. Keeps names well
/// under the common 255-byte file name limit.
const MAX_INLINE_NAME: usize = 200;

/// Errors raised by a storage medium
#[derive(Debug, Error)]
pub enum StorageError {
    /// Writing would exceed the medium's byte budget
    #[error("Storage quota exceeded: need {needed} bytes, limit is {limit} bytes")]
    QuotaExceeded { needed: u64, limit: u64 },

    /// Underlying I/O failed
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A durable medium holding text records keyed by identifier
pub trait StorageBackend: Send + Sync {
    /// Reads a record, returning `Ok(None)` if it does not exist
    fn read(&self, id: &str) -> Result<Option<String>, StorageError>;

    /// Writes a record, replacing any previous contents
    fn write(&self, id: &str, contents: &str) -> Result<(), StorageError>;

    /// Removes a record. Removing a missing record is not an error.
    fn remove(&self, id: &str) -> Result<(), StorageError>;

    /// Lists identifiers that start with `prefix`
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Size in bytes of a stored record's contents, `Ok(None)` if it does not exist
    fn size(&self, id: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.read(id)?.map(|contents| contents.len() as u64))
    }
}

/// Checks a proposed write against an optional byte quota
fn check_quota(
    quota: Option<u64>,
    used: u64,
    replaced: u64,
    incoming: u64,
) -> Result<(), StorageError> {
    if let Some(limit) = quota {
        let needed = used.saturating_sub(replaced) + incoming;
        if needed > limit {
            return Err(StorageError::QuotaExceeded { needed, limit });
        }
    }
    Ok(())
}

/// Where a record lives on disk
struct RecordFile {
    path: PathBuf,
    /// First line of a hashed record: the encoded identifier it belongs to
    header: Option<String>,
}

impl RecordFile {
    fn header_len(&self) -> u64 {
        self.header.as_ref().map_or(0, |h| h.len() as u64 + 1)
    }

    /// Strips and checks the header, returning the record contents
    fn contents(&self, raw: String) -> Option<String> {
        match &self.header {
            None => Some(raw),
            Some(header) => {
                let (found, contents) = raw.split_once('\n')?;
                (found == header).then(|| contents.to_string())
            }
        }
    }
}

/// Stores each record as a file in a directory
///
/// Identifiers are base64url-encoded into file names, so any string is a valid
/// identifier. Identifiers too long for a file name are stored under a SHA-256
/// of the identifier, with the encoded identifier on the file's first line.
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Directory where record files are stored
    dir: PathBuf,
    /// Optional cap on the total size of all record files
    quota_bytes: Option<u64>,
}

impl FileStorage {
    /// Creates a file store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes: None,
        }
    }

    /// Caps the total size of all record files
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Returns the directory holding record files
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn record_file(&self, id: &str) -> RecordFile {
        let encoded = URL_SAFE_NO_PAD.encode(id);
        if encoded.len() <= MAX_INLINE_NAME {
            return RecordFile {
                path: self.dir.join(format!("{}.{}", encoded, RECORD_EXTENSION)),
                header: None,
            };
        }

        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        RecordFile {
            path: self
                .dir
                .join(format!("{:x}.{}", hasher.finalize(), HASHED_EXTENSION)),
            header: Some(encoded),
        }
    }

    /// Recovers the identifier of a file this store wrote
    fn identify(&self, name: &str) -> Option<String> {
        let encoded = if let Some(stem) = name.strip_suffix(&format!(".{}", RECORD_EXTENSION)) {
            stem.to_string()
        } else if name.ends_with(&format!(".{}", HASHED_EXTENSION)) {
            let raw = fs::read_to_string(self.dir.join(name)).ok()?;
            raw.split_once('\n')?.0.to_string()
        } else {
            return None;
        };
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn used_bytes(&self) -> Result<u64, StorageError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut total = 0;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl StorageBackend for FileStorage {
    fn read(&self, id: &str) -> Result<Option<String>, StorageError> {
        let file = self.record_file(id);
        match fs::read_to_string(&file.path) {
            Ok(raw) => Ok(file.contents(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &str, contents: &str) -> Result<(), StorageError> {
        let file = self.record_file(id);
        let body = match &file.header {
            Some(header) => format!("{}\n{}", header, contents),
            None => contents.to_string(),
        };

        if self.quota_bytes.is_some() {
            let replaced = fs::metadata(&file.path).map(|m| m.len()).unwrap_or(0);
            check_quota(
                self.quota_bytes,
                self.used_bytes()?,
                replaced,
                body.len() as u64,
            )?;
        }

        fs::create_dir_all(&self.dir)?;
        fs::write(&file.path, body)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.record_file(id).path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            // Skip files this store did not write
            let Some(id) = name.to_str().and_then(|name| self.identify(name)) else {
                continue;
            };
            if id.starts_with(prefix) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn size(&self, id: &str) -> Result<Option<u64>, StorageError> {
        let file = self.record_file(id);
        match fs::metadata(&file.path) {
            Ok(meta) => Ok(Some(meta.len().saturating_sub(file.header_len()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemoryStorage {
    /// Creates an empty in-memory store with no quota
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty in-memory store with a byte quota
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A panic while holding this lock cannot leave the map half-updated
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self, id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(id).cloned())
    }

    fn write(&self, id: &str, contents: &str) -> Result<(), StorageError> {
        let mut records = self.lock();
        let used: u64 = records.values().map(|v| v.len() as u64).sum();
        let replaced = records.get(id).map(|v| v.len() as u64).unwrap_or(0);
        check_quota(self.quota_bytes, used, replaced, contents.len() as u64)?;
        records.insert(id.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.lock().remove(id);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .lock()
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }
}
