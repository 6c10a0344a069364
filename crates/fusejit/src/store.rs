//! Persistent layer of the module cache.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{JitError, JitResult};
use crate::key::CacheKey;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
const ARTIFACT_EXTENSION: &str = "artifact";

/// Byte storage addressed by cache key. Writes must be atomic: readers see either nothing or a
/// complete record.
pub trait ArtifactStore: Send + Sync {
    fn read(&self, key: &CacheKey) -> JitResult<Option<Vec<u8>>>;
    fn write(&self, key: &CacheKey, bytes: &[u8]) -> JitResult<()>;
    fn exists(&self, key: &CacheKey) -> bool;
    /// Returns whether an entry was removed.
    fn remove(&self, key: &CacheKey) -> JitResult<bool>;
}

/// Compiled library plus what is needed to load it without recompiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub format: u32,
    pub key: String,
    pub entry: String,
    pub has_init: bool,
    pub reentrant: bool,
    pub library: Vec<u8>,
}

impl ArtifactRecord {
    pub fn new(
        key: &CacheKey,
        entry: impl Into<String>,
        has_init: bool,
        reentrant: bool,
        library: Vec<u8>,
    ) -> Self {
        Self {
            format: ARTIFACT_FORMAT_VERSION,
            key: key.to_hex(),
            entry: entry.into(),
            has_init,
            reentrant,
            library,
        }
    }

    pub fn encode(&self) -> JitResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses a stored record, rejecting anything that does not belong to `key`.
    pub fn decode(key: &CacheKey, bytes: &[u8]) -> JitResult<Self> {
        let corrupt = |message: String| JitError::CacheCorruption {
            key: key.to_hex(),
            message,
        };
        let record: ArtifactRecord =
            bincode::deserialize(bytes).map_err(|err| corrupt(err.to_string()))?;
        if record.format != ARTIFACT_FORMAT_VERSION {
            return Err(corrupt(format!(
                "artifact format {} (expected {ARTIFACT_FORMAT_VERSION})",
                record.format
            )));
        }
        if record.key != key.to_hex() {
            return Err(corrupt(format!("record belongs to key {}", record.key)));
        }
        if record.library.is_empty() {
            return Err(corrupt("record carries an empty library".to_string()));
        }
        Ok(record)
    }
}

/// `<root>/<first two hex digits>/<key>.artifact`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.shard())
            .join(format!("{}.{ARTIFACT_EXTENSION}", key.to_hex()))
    }
}

impl ArtifactStore for DiskStore {
    fn read(&self, key: &CacheKey) -> JitResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(JitError::io(format!("read {}", path.display()), err)),
        }
    }

    fn write(&self, key: &CacheKey, bytes: &[u8]) -> JitResult<()> {
        let path = self.path_for(key);
        let dir = path
            .parent()
            .ok_or_else(|| JitError::Io {
                context: format!("artifact path {}", path.display()),
                message: "has no parent directory".to_string(),
            })?
            .to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|err| JitError::io(format!("create {}", dir.display()), err))?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|err| JitError::io(format!("create temp file in {}", dir.display()), err))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| JitError::io(format!("write {}", tmp.path().display()), err))?;
        tmp.persist(&path)
            .map_err(|err| JitError::io(format!("persist {}", path.display()), err.error))?;
        Ok(())
    }

    fn exists(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    fn remove(&self, key: &CacheKey) -> JitResult<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(JitError::io(format!("remove {}", path.display()), err)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryStore {
    fn read(&self, key: &CacheKey) -> JitResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .expect("memory store poisoned")
            .get(key)
            .cloned())
    }

    fn write(&self, key: &CacheKey, bytes: &[u8]) -> JitResult<()> {
        self.entries
            .lock()
            .expect("memory store poisoned")
            .insert(*key, bytes.to_vec());
        Ok(())
    }

    fn exists(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .expect("memory store poisoned")
            .contains_key(key)
    }

    fn remove(&self, key: &CacheKey) -> JitResult<bool> {
        Ok(self
            .entries
            .lock()
            .expect("memory store poisoned")
            .remove(key)
            .is_some())
    }
}
