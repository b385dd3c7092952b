//! Replication checkpoints
//!
//! One record per (partition, peer) pair. Saving merges with whatever is
//! already stored by taking the larger sequence on each side, so a checkpoint
//! only ever moves forward. [`CheckpointStore::reset`] is the one way back.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::PartitionId;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition_id: PartitionId,
    pub peer_id: String,
    pub last_pushed_seq: u64,
    pub last_pulled_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(partition_id: PartitionId, peer_id: impl Into<String>) -> Self {
        Self {
            partition_id,
            peer_id: peer_id.into(),
            last_pushed_seq: 0,
            last_pulled_seq: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn advance_pushed(&mut self, seq: u64) {
        if seq > self.last_pushed_seq {
            self.last_pushed_seq = seq;
            self.updated_at = Utc::now();
        }
    }

    pub fn advance_pulled(&mut self, seq: u64) {
        if seq > self.last_pulled_seq {
            self.last_pulled_seq = seq;
            self.updated_at = Utc::now();
        }
    }

    /// Fold in another record for the same pair, keeping the larger cursors.
    pub fn merge(&mut self, other: &Checkpoint) {
        self.last_pushed_seq = self.last_pushed_seq.max(other.last_pushed_seq);
        self.last_pulled_seq = self.last_pulled_seq.max(other.last_pulled_seq);
        self.updated_at = self.updated_at.max(other.updated_at);
    }
}

/// Durable home for checkpoints. Only the owning replication task writes.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, partition: &PartitionId, peer_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Persist `checkpoint`, never moving a stored cursor backwards.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Forget the pair entirely (e.g. the partition was abandoned).
    fn reset(&self, partition: &PartitionId, peer_id: &str) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<(PartitionId, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, partition: &PartitionId, peer_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(partition.clone(), peer_id.to_string()))
            .cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let key = (checkpoint.partition_id.clone(), checkpoint.peer_id.clone());
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .and_modify(|stored| stored.merge(checkpoint))
            .or_insert_with(|| checkpoint.clone());
        Ok(())
    }

    fn reset(&self, partition: &PartitionId, peer_id: &str) -> Result<(), CheckpointError> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(partition.clone(), peer_id.to_string()));
        Ok(())
    }
}

/// Stores each checkpoint as `{root}/{partition}/checkpoints/{peer}.json`,
/// where `{peer}` is a short hash of the peer id (peer ids are URLs).
pub struct FileCheckpointStore {
    root: PathBuf,
    /// Held across read, merge and rename so concurrent saves cannot
    /// overwrite each other with an older merge
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, partition: &PartitionId, peer_id: &str) -> PathBuf {
        let digest = Sha256::digest(peer_id.as_bytes());
        let name = hex::encode(&digest[..8]);
        self.root
            .join(partition.as_str())
            .join("checkpoints")
            .join(format!("{}.json", name))
    }
}

fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| CheckpointError::Serialization(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CheckpointError::Io(e.to_string())),
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, partition: &PartitionId, peer_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        read_checkpoint(&self.path_for(partition, peer_id))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.partition_id, &checkpoint.peer_id);
        let dir = path
            .parent()
            .ok_or_else(|| CheckpointError::Io(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| CheckpointError::Io(e.to_string()))?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut merged = checkpoint.clone();
        if let Some(stored) = read_checkpoint(&path)? {
            merged.merge(&stored);
        }
        let json = serde_json::to_vec_pretty(&merged)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        // Write next to the target and rename over it
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CheckpointError::Io(e.to_string()))?;
        tmp.write_all(&json).map_err(|e| CheckpointError::Io(e.to_string()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| CheckpointError::Io(e.to_string()))?;
        tmp.persist(&path)
            .map_err(|e| CheckpointError::Io(e.error.to_string()))?;
        Ok(())
    }

    fn reset(&self, partition: &PartitionId, peer_id: &str) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match std::fs::remove_file(self.path_for(partition, peer_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Io(e.to_string())),
        }
    }
}
