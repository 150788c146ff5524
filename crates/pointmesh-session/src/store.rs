//! Best-effort recovery snapshots.
//!
//! A snapshot holds only what the local peer owns: its identity, profile and
//! round state. Everything else is re-learned from the mesh.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pointmesh_protocol::{PeerId, PlayerProfile, ReactionValue, SessionId, VoteValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// Cached state of the local peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: SessionId,
    pub peer_id: PeerId,
    pub is_bootstrap: bool,
    pub profile: PlayerProfile,
    #[serde(default)]
    pub vote: Option<VoteValue>,
    #[serde(default)]
    pub reaction: Option<ReactionValue>,
    #[serde(default)]
    pub reaction_timestamp: Option<u64>,
    #[serde(default)]
    pub revealed: bool,
}

/// Where snapshots are kept.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

/// Snapshot kept as a JSON file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved snapshot to {:?}", self.path);
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Snapshot kept in memory; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<Snapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot() -> Snapshot {
        Snapshot {
            session_id: SessionId::parse("123456789").unwrap(),
            peer_id: PeerId::new("3f9a0c1d2e4b5a6f"),
            is_bootstrap: false,
            profile: PlayerProfile::new("Alice"),
            vote: Some(VoteValue::Half),
            reaction: Some(ReactionValue::Coffee),
            reaction_timestamp: Some(1_700_000_000_000),
            revealed: true,
        }
    }

    #[test]
    fn file_store_round_trip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nested").join("session.json"));

        assert_eq!(store.load().unwrap(), None);
        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot()));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn snapshot_file_is_plain_json() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("session.json"));
        store.save(&snapshot()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["session_id"], "123456789");
        assert_eq!(raw["vote"], "½");
        assert_eq!(raw["profile"]["name"], "Alice");
    }

    #[test]
    fn memory_store_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.save(&snapshot()).unwrap();
        assert_eq!(other.load().unwrap(), Some(snapshot()));
        other.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
