//! Server record stores: a JSON file for nodes and an in-memory map for
//! tests and ephemeral runs.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{ServerAddr, ServerPoolError, ServerRecord};
use crate::ports::ServerPoolStore;

/// Records persisted as one JSON object keyed by server address.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ServerPoolStore for JsonFileStore {
    fn load(&self) -> Result<BTreeMap<ServerAddr, ServerRecord>, ServerPoolError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, records: &BTreeMap<ServerAddr, ServerRecord>) -> Result<(), ServerPoolError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Records kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<ServerAddr, ServerRecord>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerPoolStore for MemoryStore {
    fn load(&self) -> Result<BTreeMap<ServerAddr, ServerRecord>, ServerPoolError> {
        Ok(self.records.lock().clone())
    }

    fn save(&self, records: &BTreeMap<ServerAddr, ServerRecord>) -> Result<(), ServerPoolError> {
        *self.records.lock() = records.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BTreeMap<ServerAddr, ServerRecord> {
        let mut records = BTreeMap::new();
        records.insert(
            ServerAddr::new("10.0.0.1:30303"),
            ServerRecord {
                failure_streak: 2,
                latency_ewma_ms: Some(42.0),
                last_seen_ms: 1_000,
                last_failure_ms: Some(2_000),
                stale: false,
            },
        );
        records
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("servers.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("servers.json");
        JsonFileStore::new(&path).save(&sample()).unwrap();

        let loaded = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(loaded, sample());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        fs::write(&path, "{not json").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, ServerPoolError::Codec(_)));
    }
}
