//! A single partition: documents, change log and the write path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::sync::watch;

use super::log::{ChangeLog, LogRecord};
use super::{
    ChangeEntry, Document, Order, PartitionId, ReplicatedDocument, StoreConfig, StoreError,
    DESIGN_ID_PREFIX, LOCAL_ID_PREFIX,
};
use crate::feed::ChangeSubscription;
use crate::revision::{verify_revision, InsertOutcome, Revision, RevisionRef, RevisionTree};

/// Result of grafting a replicated revision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { seq: u64 },
    AlreadyPresent,
}

struct PartitionState {
    docs: BTreeMap<String, RevisionTree>,
    changes: Vec<ChangeEntry>,
    last_seq: u64,
    log: Option<ChangeLog>,
}

/// Handle to one isolated partition.
///
/// All mutation happens under the partition's write lock, so the revision
/// check, the tree update and the change-log append are one atomic step. The
/// sequence watch is bumped only after the entry is visible to readers.
pub struct Partition {
    id: PartitionId,
    config: StoreConfig,
    state: RwLock<PartitionState>,
    seq_tx: watch::Sender<u64>,
}

impl Partition {
    pub(super) fn in_memory(id: PartitionId, config: StoreConfig) -> Self {
        let (seq_tx, _) = watch::channel(0);
        Self {
            id,
            config,
            state: RwLock::new(PartitionState {
                docs: BTreeMap::new(),
                changes: Vec::new(),
                last_seq: 0,
                log: None,
            }),
            seq_tx,
        }
    }

    /// Open the partition stored in `dir`, replaying its log.
    pub(super) fn open(id: PartitionId, config: StoreConfig, dir: &Path) -> Result<Self, StoreError> {
        let (log, records) = ChangeLog::open(dir, config.sync_writes)?;

        let mut docs: BTreeMap<String, RevisionTree> = BTreeMap::new();
        let mut changes = Vec::with_capacity(records.len());
        let mut last_seq = 0;
        for record in records {
            if record.seq <= last_seq {
                log::warn!(
                    "[{}] skipping out-of-order log record seq {} (last {})",
                    id, record.seq, last_seq
                );
                continue;
            }
            docs.entry(record.id.clone()).or_default().graft(
                record.revision.clone(),
                record.deleted,
                record.body,
                &record.ancestry,
            );
            changes.push(ChangeEntry {
                seq: record.seq,
                id: record.id,
                revision: record.revision,
                deleted: record.deleted,
            });
            last_seq = record.seq;
        }
        log::debug!("[{}] replayed {} changes from {}", id, changes.len(), dir.display());

        let (seq_tx, _) = watch::channel(last_seq);
        Ok(Self {
            id,
            config,
            state: RwLock::new(PartitionState {
                docs,
                changes,
                last_seq,
                log: Some(log),
            }),
            seq_tx,
        })
    }

    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PartitionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PartitionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The winning revision of `id`. Tombstoned documents are `NotFound`.
    pub fn get(&self, id: &str) -> Result<Document, StoreError> {
        let state = self.read_state();
        let winner = state
            .docs
            .get(id)
            .and_then(RevisionTree::winner)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if winner.deleted {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(Document {
            id: id.to_string(),
            revision: winner.revision.clone(),
            deleted: false,
            body: winner.body.clone().unwrap_or(Value::Null),
        })
    }

    /// Read-time conflict resolution: the deterministic winner.
    pub fn resolve(&self, id: &str) -> Result<Document, StoreError> {
        self.get(id)
    }

    /// A specific leaf revision (winning or not), including tombstones.
    pub fn get_revision(&self, id: &str, rev: &RevisionRef) -> Result<Document, StoreError> {
        let state = self.read_state();
        let node = state
            .docs
            .get(id)
            .and_then(|t| t.get(rev))
            .filter(|n| n.body.is_some())
            .ok_or_else(|| StoreError::NotFound(format!("{}@{}", id, rev)))?;
        Ok(Document {
            id: id.to_string(),
            revision: node.revision.clone(),
            deleted: node.deleted,
            body: node.body.clone().unwrap_or(Value::Null),
        })
    }

    /// Losing leaf revisions of `id`
    pub fn conflicts(&self, id: &str) -> Result<Vec<Revision>, StoreError> {
        let state = self.read_state();
        let tree = state
            .docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(tree.conflicts().into_iter().map(|n| n.revision.clone()).collect())
    }

    /// Every leaf of `id` with its ancestry, ready to send to a peer.
    pub fn leaf_revisions(&self, id: &str) -> Result<Vec<ReplicatedDocument>, StoreError> {
        let state = self.read_state();
        let tree = state
            .docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(tree
            .leaves()
            .map(|n| ReplicatedDocument {
                id: id.to_string(),
                revision: n.revision.clone(),
                deleted: n.deleted,
                body: n.body.clone().unwrap_or(Value::Null),
                ancestry: tree.ancestry(&n.revision.id()),
            })
            .collect())
    }

    /// Which of `revs` this partition has never seen for `id`.
    pub fn missing_revisions(&self, id: &str, revs: &[RevisionRef]) -> Vec<RevisionRef> {
        let state = self.read_state();
        match state.docs.get(id) {
            Some(tree) => revs.iter().filter(|r| !tree.contains(r)).copied().collect(),
            None => revs.to_vec(),
        }
    }

    /// Lazily enumerate live documents (tombstones and `_local/` ids are
    /// skipped). Each call starts over from the current set of ids.
    pub fn all_documents(self: &Arc<Self>, order: Order) -> AllDocuments {
        let mut ids: Vec<String> = self
            .read_state()
            .docs
            .keys()
            .filter(|id| !id.starts_with(LOCAL_ID_PREFIX))
            .cloned()
            .collect();
        if order == Order::Descending {
            ids.reverse();
        }
        AllDocuments {
            partition: Some(Arc::clone(self)),
            ids: ids.into_iter(),
        }
    }

    pub fn changes_since(&self, seq: u64) -> Vec<ChangeEntry> {
        self.changes_since_limited(seq, usize::MAX)
    }

    /// Up to `limit` entries with `seq` greater than the given one.
    pub fn changes_since_limited(&self, seq: u64, limit: usize) -> Vec<ChangeEntry> {
        let state = self.read_state();
        let start = state.changes.partition_point(|e| e.seq <= seq);
        state.changes[start..].iter().take(limit).cloned().collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.read_state().last_seq
    }

    /// Number of ids with at least one revision (tombstones included)
    pub fn doc_count(&self) -> usize {
        self.read_state().docs.len()
    }

    pub fn subscribe(self: &Arc<Self>, from_seq: u64) -> ChangeSubscription {
        ChangeSubscription::new(Arc::clone(self), from_seq)
    }

    pub(crate) fn watch_seq(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Optimistic write. `expected` must name the current winner (or another
    /// leaf, which is how losing branches are resolved). Without `expected`
    /// the write only succeeds for new or deleted documents, or when the
    /// store allows branch creation.
    pub fn put(&self, id: &str, expected: Option<&Revision>, body: Value) -> Result<Revision, StoreError> {
        self.write(id, expected, body, false)
    }

    /// Tombstone write.
    pub fn delete(&self, id: &str, expected: &Revision) -> Result<Revision, StoreError> {
        self.write(id, Some(expected), Value::Null, true)
    }

    fn write(
        &self,
        id: &str,
        expected: Option<&Revision>,
        body: Value,
        deleted: bool,
    ) -> Result<Revision, StoreError> {
        validate_id(id)?;

        let mut state = self.write_state();
        let mut tree = state.docs.get(id).cloned().unwrap_or_default();
        let parent = self.choose_parent(id, &tree, expected)?;

        let (revision, outcome) = tree.extend(parent.as_ref(), body.clone(), deleted);
        if outcome == InsertOutcome::AlreadyPresent {
            // Same content on the same parent: nothing new to record
            return Ok(revision);
        }

        let record = LogRecord {
            seq: state.last_seq + 1,
            id: id.to_string(),
            revision: revision.clone(),
            deleted,
            body,
            ancestry: tree.ancestry(&revision.id()),
        };
        self.commit(&mut state, tree, record)?;
        Ok(revision)
    }

    fn choose_parent(
        &self,
        id: &str,
        tree: &RevisionTree,
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>, StoreError> {
        let winner = tree.winner();
        let conflict = || StoreError::Conflict {
            id: id.to_string(),
            current: winner.map(|w| w.revision.clone()),
        };

        match (winner, expected) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(conflict()),
            (Some(_), Some(expected)) => {
                let wanted = expected.id();
                if tree.is_leaf(&wanted) {
                    Ok(tree.get(&wanted).map(|n| n.revision.clone()))
                } else {
                    Err(conflict())
                }
            }
            (Some(w), None) if w.deleted => Ok(Some(w.revision.clone())),
            (Some(_), None) if self.config.allow_branches => Ok(None),
            (Some(_), None) => Err(conflict()),
        }
    }

    /// Graft a revision received from a peer. Never conflicts: a diverging
    /// revision simply becomes another leaf. Known revisions are a no-op.
    pub fn apply_replicated(&self, doc: &ReplicatedDocument) -> Result<ApplyOutcome, StoreError> {
        validate_id(&doc.id)?;
        if let Some(parent) = doc.revision.parent {
            if doc.ancestry.first().is_some_and(|a| *a != parent) {
                return Err(StoreError::InvalidRevision(format!(
                    "{}: ancestry does not start at parent {}",
                    doc.id, parent
                )));
            }
        }
        if !verify_revision(&doc.revision, &doc.body, doc.deleted) {
            return Err(StoreError::InvalidRevision(format!(
                "{}: hash mismatch for {}",
                doc.id, doc.revision
            )));
        }

        let mut state = self.write_state();
        let mut tree = state.docs.get(&doc.id).cloned().unwrap_or_default();
        let outcome = tree.graft(doc.revision.clone(), doc.deleted, doc.body.clone(), &doc.ancestry);
        if outcome == InsertOutcome::AlreadyPresent {
            return Ok(ApplyOutcome::AlreadyPresent);
        }

        let seq = state.last_seq + 1;
        let record = LogRecord {
            seq,
            id: doc.id.clone(),
            revision: doc.revision.clone(),
            deleted: doc.deleted,
            body: doc.body.clone(),
            ancestry: doc.ancestry.clone(),
        };
        self.commit(&mut state, tree, record)?;
        Ok(ApplyOutcome::Applied { seq })
    }

    /// Persist then publish. The in-memory state is only touched once the log
    /// append succeeded, so a failed write leaves the previous tree intact.
    fn commit(
        &self,
        state: &mut PartitionState,
        tree: RevisionTree,
        record: LogRecord,
    ) -> Result<(), StoreError> {
        if let Some(log) = state.log.as_mut() {
            log.append(&record)?;
        }

        let seq = record.seq;
        state.docs.insert(record.id.clone(), tree);
        state.changes.push(ChangeEntry {
            seq,
            id: record.id,
            revision: record.revision,
            deleted: record.deleted,
        });
        state.last_seq = seq;
        self.seq_tx.send_replace(seq);
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.starts_with(DESIGN_ID_PREFIX) {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    if id.starts_with('_') && !id.starts_with(LOCAL_ID_PREFIX) {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Lazy, finite enumeration returned by [`Partition::all_documents`].
pub struct AllDocuments {
    partition: Option<Arc<Partition>>,
    ids: std::vec::IntoIter<String>,
}

impl AllDocuments {
    /// Enumeration over a partition that does not exist
    pub(crate) fn empty() -> Self {
        Self {
            partition: None,
            ids: Vec::new().into_iter(),
        }
    }
}

impl Iterator for AllDocuments {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        let partition = self.partition.as_ref()?;
        for id in self.ids.by_ref() {
            if let Ok(doc) = partition.get(&id) {
                return Some(doc);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{compare, Winner};
    use serde_json::json;

    fn partition(config: StoreConfig) -> Arc<Partition> {
        Arc::new(Partition::in_memory(PartitionId::new("db_ws_1").unwrap(), config))
    }

    #[test]
    fn test_put_then_get_returns_body_and_higher_generation() {
        let p = partition(StoreConfig::default());
        let first = p.put("occ1", None, json!({"species": "xuthus"})).unwrap();
        assert_eq!(first.generation, 1);

        let second = p.put("occ1", Some(&first), json!({"species": "machaon"})).unwrap();
        let doc = p.get("occ1").unwrap();
        assert_eq!(doc.body, json!({"species": "machaon"}));
        assert_eq!(doc.revision, second);
        assert!(doc.revision.generation > first.generation);
    }

    #[test]
    fn test_stale_expected_revision_conflicts() {
        let p = partition(StoreConfig::default());
        let r1 = p.put("occ1", None, json!({"v": 1})).unwrap();
        let r2 = p.put("occ1", Some(&r1), json!({"v": 2})).unwrap();

        match p.put("occ1", Some(&r1), json!({"v": "stale"})) {
            Err(StoreError::Conflict { current, .. }) => assert_eq!(current, Some(r2.clone())),
            other => panic!("expected conflict, got {:?}", other),
        }
        // Prior revision untouched, nothing appended
        assert_eq!(p.get("occ1").unwrap().revision, r2);
        assert_eq!(p.last_seq(), 2);
    }

    #[test]
    fn test_put_without_revision_on_existing_conflicts() {
        let p = partition(StoreConfig::default());
        p.put("occ1", None, json!({"v": 1})).unwrap();
        let err = p.put("occ1", None, json!({"v": 2})).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(p.changes_since(0).len(), 1);
    }

    #[test]
    fn test_expected_revision_on_missing_document_conflicts() {
        let p = partition(StoreConfig::default());
        let other = partition(StoreConfig::default());
        let rev = other.put("x", None, json!({})).unwrap();
        assert!(p.put("x", Some(&rev), json!({})).unwrap_err().is_conflict());
    }

    #[test]
    fn test_branch_creation_when_allowed() {
        let p = partition(StoreConfig {
            allow_branches: true,
            ..StoreConfig::default()
        });
        let a = p.put("occ1", None, json!({"species": "xuthus"})).unwrap();
        let b = p.put("occ1", None, json!({"species": "glaucus"})).unwrap();
        assert_eq!(a.generation, 1);
        assert_eq!(b.generation, 1);

        let winner = p.resolve("occ1").unwrap();
        let expected = if compare(&a.id(), &b.id()) == Winner::Left { a } else { b };
        assert_eq!(winner.revision, expected);
        assert_eq!(p.conflicts("occ1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_is_a_tombstone() {
        let p = partition(StoreConfig::default());
        let r1 = p.put("occ1", None, json!({"v": 1})).unwrap();
        let tomb = p.delete("occ1", &r1).unwrap();

        assert!(p.get("occ1").unwrap_err().is_not_found());
        let entries = p.changes_since(0);
        assert_eq!(entries.len(), 2);
        assert!(entries[1].deleted);
        assert_eq!(entries[1].revision, tomb);
        assert!(p.get_revision("occ1", &tomb.id()).unwrap().deleted);

        // Recreating a deleted document extends the tombstone branch
        let again = p.put("occ1", None, json!({"v": 3})).unwrap();
        assert_eq!(again.generation, 3);
    }

    #[test]
    fn test_changes_are_monotonic_and_one_per_write() {
        let p = partition(StoreConfig::default());
        let r = p.put("a", None, json!(1)).unwrap();
        p.put("b", None, json!(2)).unwrap();
        p.put("a", Some(&r), json!(3)).unwrap();

        let seqs: Vec<u64> = p.changes_since(0).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        let tail: Vec<String> = p.changes_since(1).into_iter().map(|e| e.id).collect();
        assert_eq!(tail, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(p.changes_since_limited(0, 2).len(), 2);
    }

    #[test]
    fn test_all_documents_order_and_restart() {
        let p = partition(StoreConfig::default());
        for id in ["b", "a", "c"] {
            p.put(id, None, json!({"id": id})).unwrap();
        }
        p.put("_local/cfg", None, json!({})).unwrap();

        let asc: Vec<String> = p.all_documents(Order::Ascending).map(|d| d.id).collect();
        assert_eq!(asc, vec!["a", "b", "c"]);
        let desc: Vec<String> = p.all_documents(Order::Descending).map(|d| d.id).collect();
        assert_eq!(desc, vec!["c", "b", "a"]);

        // A fresh call sees new state
        p.put("d", None, json!({})).unwrap();
        assert_eq!(p.all_documents(Order::Ascending).count(), 4);
    }

    #[test]
    fn test_reserved_ids_rejected() {
        let p = partition(StoreConfig::default());
        assert!(matches!(p.put("", None, json!({})), Err(StoreError::InvalidId(_))));
        assert!(matches!(p.put("_design/x", None, json!({})), Err(StoreError::InvalidId(_))));
        assert!(matches!(p.put("_other", None, json!({})), Err(StoreError::InvalidId(_))));
        assert!(p.put("_local/x", None, json!({})).is_ok());
    }

    #[test]
    fn test_apply_replicated_is_idempotent() {
        let source = partition(StoreConfig::default());
        let r1 = source.put("occ1", None, json!({"v": 1})).unwrap();
        source.put("occ1", Some(&r1), json!({"v": 2})).unwrap();
        let leaves = source.leaf_revisions("occ1").unwrap();
        assert_eq!(leaves.len(), 1);

        let target = partition(StoreConfig::default());
        assert_eq!(
            target.apply_replicated(&leaves[0]).unwrap(),
            ApplyOutcome::Applied { seq: 1 }
        );
        assert_eq!(target.apply_replicated(&leaves[0]).unwrap(), ApplyOutcome::AlreadyPresent);
        assert_eq!(target.last_seq(), 1);
        assert_eq!(target.get("occ1").unwrap().body, json!({"v": 2}));
        assert!(target.missing_revisions("occ1", &[r1.id()]).is_empty());
    }

    #[test]
    fn test_apply_replicated_keeps_divergent_branch() {
        let local = partition(StoreConfig::default());
        local.put("occ1", None, json!({"species": "xuthus"})).unwrap();

        let remote = partition(StoreConfig::default());
        remote.put("occ1", None, json!({"species": "glaucus"})).unwrap();

        for doc in remote.leaf_revisions("occ1").unwrap() {
            local.apply_replicated(&doc).unwrap();
        }
        assert_eq!(local.leaf_revisions("occ1").unwrap().len(), 2);
        assert_eq!(local.conflicts("occ1").unwrap().len(), 1);
    }

    #[test]
    fn test_apply_replicated_rejects_tampered_body() {
        let source = partition(StoreConfig::default());
        source.put("occ1", None, json!({"v": 1})).unwrap();
        let mut doc = source.leaf_revisions("occ1").unwrap().remove(0);
        doc.body = json!({"v": 999});

        let target = partition(StoreConfig::default());
        assert!(matches!(
            target.apply_replicated(&doc),
            Err(StoreError::InvalidRevision(_))
        ));
        assert_eq!(target.last_seq(), 0);
    }

    #[test]
    fn test_apply_replicated_rejects_exhausted_generation() {
        use crate::revision::{next_revision, RevisionHash};

        let parent = Revision {
            generation: u64::MAX,
            hash: RevisionHash::from_bytes([1; 32]),
            parent: None,
        };
        let body = json!({"v": 1});
        let doc = ReplicatedDocument {
            id: "occ1".to_string(),
            revision: next_revision(Some(&parent), &body, false),
            deleted: false,
            body,
            ancestry: vec![parent.id()],
        };

        let target = partition(StoreConfig::default());
        assert!(matches!(
            target.apply_replicated(&doc),
            Err(StoreError::InvalidRevision(_))
        ));
        assert!(target.get("occ1").unwrap_err().is_not_found());
        assert_eq!(target.last_seq(), 0);
    }
}
