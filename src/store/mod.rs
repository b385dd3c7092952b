//! Local document store
//!
//! A `LocalStore` owns any number of isolated partitions, one per
//! workstation. Each partition is a key → revision-tree map plus a monotonic
//! change log. Writes go through optimistic concurrency on a leaf
//! revision; replicated revisions are grafted into the tree so concurrent
//! edits survive as sibling branches.
//!
//! Stores are either in-memory or backed by a directory holding one
//! append-only log per partition (see [`log`]).

mod log;
mod partition;

pub use partition::{AllDocuments, ApplyOutcome, Partition};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::feed::ChangeSubscription;
use crate::revision::{Revision, RevisionRef};

/// Ids with this prefix stay on the device and are never replicated.
pub const LOCAL_ID_PREFIX: &str = "_local/";

/// Reserved prefix; writes to these ids are refused.
pub const DESIGN_ID_PREFIX: &str = "_design/";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conflict on {id}: current revision is {}", describe_revision(.current))]
    Conflict { id: String, current: Option<Revision> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn describe_revision(rev: &Option<Revision>) -> String {
    rev.as_ref()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Name of an isolated local store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Use `name` verbatim. Only ASCII alphanumerics, `_` and `-` are accepted
    /// since the name doubles as a directory name and a URL path segment.
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        if !is_safe_name(&name) {
            return Err(StoreError::InvalidId(format!("partition name {:?}", name)));
        }
        Ok(Self(name))
    }

    /// Partition for a tenant (workstation): `{prefix}_ws_{tenant}`.
    pub fn for_tenant(prefix: &str, tenant: &str) -> Result<Self, StoreError> {
        if !is_safe_name(prefix) || !is_safe_name(tenant) {
            return Err(StoreError::InvalidId(format!(
                "tenant {:?} with prefix {:?}",
                tenant, prefix
            )));
        }
        Ok(Self(format!("{}_ws_{}", prefix, tenant)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_safe_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Let `put` without an expected revision start a new root branch on an
    /// existing document instead of failing with a conflict.
    pub allow_branches: bool,
    /// fsync the partition log after every write.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            allow_branches: false,
            sync_writes: true,
        }
    }
}

/// A document as seen through its winning (or an explicitly requested) revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub revision: Revision,
    pub deleted: bool,
    pub body: Value,
}

impl Document {
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// One entry of a partition's change log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub seq: u64,
    pub id: String,
    pub revision: Revision,
    pub deleted: bool,
}

/// A leaf revision with everything a peer needs to graft it: its content and
/// the chain of ancestors back to the root, nearest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    pub id: String,
    pub revision: Revision,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestry: Vec<RevisionRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Owner of all partitions on this device.
pub struct LocalStore {
    root: Option<PathBuf>,
    config: StoreConfig,
    partitions: RwLock<HashMap<PartitionId, Arc<Partition>>>,
}

impl LocalStore {
    /// A store that keeps everything in memory.
    pub fn in_memory(config: StoreConfig) -> Self {
        Self {
            root: None,
            config,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// A store persisted under `root`; partitions are loaded lazily.
    pub fn open(root: impl Into<PathBuf>, config: StoreConfig) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self {
            root: Some(root),
            config,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Open (creating or replaying as needed) the partition `id`.
    pub fn partition(&self, id: &PartitionId) -> Result<Arc<Partition>, StoreError> {
        if let Some(p) = self
            .partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            return Ok(Arc::clone(p));
        }

        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = partitions.get(id) {
            return Ok(Arc::clone(p));
        }
        let partition = match &self.root {
            Some(root) => Partition::open(id.clone(), self.config.clone(), &root.join(id.as_str()))?,
            None => Partition::in_memory(id.clone(), self.config.clone()),
        };
        let partition = Arc::new(partition);
        partitions.insert(id.clone(), Arc::clone(&partition));
        Ok(partition)
    }

    /// The partition `id` if it is already open or has a directory on disk.
    /// Never creates one.
    fn existing(&self, id: &PartitionId) -> Result<Option<Arc<Partition>>, StoreError> {
        if let Some(p) = self
            .partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            return Ok(Some(Arc::clone(p)));
        }
        match &self.root {
            Some(root) if root.join(id.as_str()).is_dir() => self.partition(id).map(Some),
            _ => Ok(None),
        }
    }

    /// Names of the partitions opened so far
    pub fn open_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self
            .partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// An unknown partition reads as empty and is not created.
    pub fn get(&self, partition: &PartitionId, id: &str) -> Result<Document, StoreError> {
        match self.existing(partition)? {
            Some(p) => p.get(id),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    pub fn put(
        &self,
        partition: &PartitionId,
        id: &str,
        expected: Option<&Revision>,
        body: Value,
    ) -> Result<Revision, StoreError> {
        self.partition(partition)?.put(id, expected, body)
    }

    pub fn all_documents(&self, partition: &PartitionId, order: Order) -> Result<AllDocuments, StoreError> {
        Ok(match self.existing(partition)? {
            Some(p) => p.all_documents(order),
            None => AllDocuments::empty(),
        })
    }

    pub fn changes_since(&self, partition: &PartitionId, seq: u64) -> Result<Vec<ChangeEntry>, StoreError> {
        Ok(self
            .existing(partition)?
            .map(|p| p.changes_since(seq))
            .unwrap_or_default())
    }

    /// Opens the partition so the subscription sees its first writes.
    pub fn subscribe(&self, partition: &PartitionId, from_seq: u64) -> Result<ChangeSubscription, StoreError> {
        Ok(self.partition(partition)?.subscribe(from_seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ws(tenant: &str) -> PartitionId {
        PartitionId::for_tenant("db", tenant).unwrap()
    }

    #[test]
    fn test_partition_naming() {
        assert_eq!(ws("42").as_str(), "db_ws_42");
        assert!(PartitionId::for_tenant("db", "").is_err());
        assert!(PartitionId::for_tenant("db", "../etc").is_err());
        assert!(PartitionId::new("has space").is_err());
    }

    #[test]
    fn test_partition_isolation() {
        let store = LocalStore::in_memory(StoreConfig::default());
        store.put(&ws("a"), "X", None, json!({"v": 1})).unwrap();

        assert!(store.get(&ws("a"), "X").is_ok());
        assert!(store.get(&ws("b"), "X").unwrap_err().is_not_found());
        assert!(store.changes_since(&ws("b"), 0).unwrap().is_empty());
        assert_eq!(store.all_documents(&ws("b"), Order::Ascending).unwrap().count(), 0);
        assert_eq!(store.open_partitions(), vec![ws("a")]);
    }

    #[test]
    fn test_reads_do_not_create_partitions_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), StoreConfig::default()).unwrap();

        assert!(store.get(&ws("9"), "occ1").unwrap_err().is_not_found());
        assert!(store.changes_since(&ws("9"), 0).unwrap().is_empty());
        assert_eq!(store.all_documents(&ws("9"), Order::Descending).unwrap().count(), 0);
        assert!(store.open_partitions().is_empty());
        assert!(!dir.path().join("db_ws_9").exists());

        // A partition written by an earlier process is found again
        store.put(&ws("9"), "occ1", None, json!({"n": 1})).unwrap();
        drop(store);
        let store = LocalStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert!(store.get(&ws("9"), "occ1").is_ok());
    }

    #[test]
    fn test_same_handle_for_same_partition() {
        let store = LocalStore::in_memory(StoreConfig::default());
        let a = store.partition(&ws("1")).unwrap();
        let b = store.partition(&ws("1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_file_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let rev;
        {
            let store = LocalStore::open(dir.path(), StoreConfig::default()).unwrap();
            let first = store.put(&ws("1"), "occ1", None, json!({"n": 1})).unwrap();
            rev = store.put(&ws("1"), "occ1", Some(&first), json!({"n": 2})).unwrap();
        }

        let store = LocalStore::open(dir.path(), StoreConfig::default()).unwrap();
        let doc = store.get(&ws("1"), "occ1").unwrap();
        assert_eq!(doc.revision, rev);
        assert_eq!(doc.body, json!({"n": 2}));
        assert_eq!(store.changes_since(&ws("1"), 0).unwrap().len(), 2);
        assert!(store.get(&ws("2"), "occ1").unwrap_err().is_not_found());
    }
}
