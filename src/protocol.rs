//! Replication wire protocol
//!
//! Three partition-scoped endpoints, shaped after the CouchDB replication API:
//!
//! - `GET _changes?since=N&limit=M`: one row per changed id (at its latest
//!   sequence), each carrying every leaf revision with its ancestry.
//! - `POST _revs_diff`: `{id: [rev, ...]}` in, the subset the peer lacks out.
//! - `POST _bulk_docs`: graft replicated revisions as-is, never conflicting.
//!
//! The client side of each call lives here alongside the matching server
//! side, which [`crate::transport::InMemoryPeer`] and tests use to play the
//! remote.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::revision::RevisionRef;
use crate::store::{Partition, PartitionId, ReplicatedDocument, StoreError, LOCAL_ID_PREFIX};
use crate::transport::{PeerRequest, Transport, TransportError};

pub const CHANGES_PATH: &str = "_changes";
pub const REVS_DIFF_PATH: &str = "_revs_diff";
pub const BULK_DOCS_PATH: &str = "_bulk_docs";

/// id → revisions, used both ways by `_revs_diff`
pub type RevsDiff = BTreeMap<String, Vec<RevisionRef>>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub seq: u64,
    pub id: String,
    pub docs: Vec<ReplicatedDocument>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    /// Resume cursor: pass it back as `since` to continue after this page
    pub last_seq: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    pub docs: Vec<ReplicatedDocument>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkDocResult {
    pub id: String,
    pub revision: RevisionRef,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsResponse {
    pub results: Vec<BulkDocResult>,
}

impl BulkDocsResponse {
    pub fn failures(&self) -> impl Iterator<Item = &BulkDocResult> + '_ {
        self.results.iter().filter(|r| !r.ok)
    }
}

// ----------------------------------------------------------------------
// Client side
// ----------------------------------------------------------------------

pub async fn fetch_changes(
    transport: &dyn Transport,
    partition: &PartitionId,
    since: u64,
    limit: usize,
) -> Result<ChangesResponse, TransportError> {
    let request = PeerRequest::get(partition, CHANGES_PATH)
        .with_query("since", since)
        .with_query("limit", limit);
    transport.send(request).await?.error_for_status()?.decode()
}

/// Ask the peer which of `revs` it does not have yet.
pub async fn revs_diff(
    transport: &dyn Transport,
    partition: &PartitionId,
    revs: &RevsDiff,
) -> Result<RevsDiff, TransportError> {
    let request = PeerRequest::post_json(partition, REVS_DIFF_PATH, revs)?;
    transport.send(request).await?.error_for_status()?.decode()
}

pub async fn bulk_docs(
    transport: &dyn Transport,
    partition: &PartitionId,
    docs: Vec<ReplicatedDocument>,
) -> Result<BulkDocsResponse, TransportError> {
    let request = PeerRequest::post_json(partition, BULK_DOCS_PATH, &BulkDocsRequest { docs })?;
    transport.send(request).await?.error_for_status()?.decode()
}

/// GET the reference dataset from an unscoped endpoint.
pub async fn fetch_reference(transport: &dyn Transport, endpoint: &str) -> Result<Value, TransportError> {
    let response = transport
        .send(PeerRequest::unscoped_get(endpoint))
        .await?
        .error_for_status()?;
    let value: Value = response.decode()?;
    if !value.is_object() {
        return Err(TransportError::Malformed(format!(
            "reference payload from {} is not an object",
            endpoint
        )));
    }
    Ok(value)
}

// ----------------------------------------------------------------------
// Server side
// ----------------------------------------------------------------------

/// Answer `_changes` from a partition.
///
/// Rows are deduplicated by id so each id appears once, at its latest
/// sequence. `_local/` ids are skipped. When the page is full, `last_seq` is
/// the sequence of the last row returned; otherwise it covers everything up
/// to the newest entry so skipped ids do not cause refetching.
pub fn serve_changes(partition: &Partition, since: u64, limit: usize) -> Result<ChangesResponse, StoreError> {
    let entries = partition.changes_since(since);
    let newest = entries.last().map_or(since, |e| e.seq);

    let mut latest: HashMap<&str, u64> = HashMap::new();
    for entry in &entries {
        if !entry.id.starts_with(LOCAL_ID_PREFIX) {
            latest.insert(entry.id.as_str(), entry.seq);
        }
    }
    let mut rows: Vec<(u64, &str)> = latest.into_iter().map(|(id, seq)| (seq, id)).collect();
    rows.sort_unstable();

    let limit = limit.max(1);
    let truncated = rows.len() > limit;
    rows.truncate(limit);
    let last_seq = match (truncated, rows.last()) {
        (true, Some((seq, _))) => *seq,
        _ => newest,
    };

    let mut results = Vec::with_capacity(rows.len());
    for (seq, id) in rows {
        results.push(ChangeRow {
            seq,
            id: id.to_string(),
            docs: partition.leaf_revisions(id)?,
        });
    }
    Ok(ChangesResponse { results, last_seq })
}

pub fn serve_revs_diff(partition: &Partition, request: &RevsDiff) -> RevsDiff {
    request
        .iter()
        .filter_map(|(id, revs)| {
            let missing = partition.missing_revisions(id, revs);
            (!missing.is_empty()).then(|| (id.clone(), missing))
        })
        .collect()
}

/// Graft every document; per-document failures are reported, not raised.
pub fn serve_bulk_docs(partition: &Partition, request: &BulkDocsRequest) -> BulkDocsResponse {
    let results = request
        .docs
        .iter()
        .map(|doc| {
            let outcome = partition.apply_replicated(doc);
            BulkDocResult {
                id: doc.id.clone(),
                revision: doc.revision.id(),
                ok: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            }
        })
        .collect();
    BulkDocsResponse { results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, StoreConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn partition() -> Arc<Partition> {
        LocalStore::in_memory(StoreConfig::default())
            .partition(&PartitionId::new("db_ws_1").unwrap())
            .unwrap()
    }

    #[test]
    fn test_changes_dedupes_and_pages() {
        let p = partition();
        let a1 = p.put("a", None, json!({"n": 1})).unwrap();
        p.put("b", None, json!({})).unwrap();
        p.put("a", Some(&a1), json!({"n": 2})).unwrap();
        p.put("_local/x", None, json!({})).unwrap();
        p.put("c", None, json!({})).unwrap();

        let all = serve_changes(&p, 0, 100).unwrap();
        let ids: Vec<&str> = all.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(all.last_seq, 5);
        assert_eq!(all.results[1].docs[0].body, json!({"n": 2}));
        assert_eq!(all.results[1].docs[0].ancestry, vec![a1.id()]);

        let page = serve_changes(&p, 0, 2).unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.last_seq, 3);
        let rest = serve_changes(&p, page.last_seq, 2).unwrap();
        assert_eq!(rest.results.len(), 1);
        assert_eq!(rest.results[0].id, "c");
        assert_eq!(rest.last_seq, 5);
    }

    #[test]
    fn test_changes_with_only_local_entries_still_advance() {
        let p = partition();
        p.put("_local/master_data", None, json!({})).unwrap();
        let resp = serve_changes(&p, 0, 10).unwrap();
        assert!(resp.results.is_empty());
        assert_eq!(resp.last_seq, 1);
    }

    #[test]
    fn test_revs_diff_and_bulk_docs() {
        let source = partition();
        let target = partition();
        source.put("a", None, json!({"n": 1})).unwrap();
        let docs = source.leaf_revisions("a").unwrap();

        let mut ask = RevsDiff::new();
        ask.insert("a".to_string(), docs.iter().map(|d| d.revision.id()).collect());
        assert_eq!(serve_revs_diff(&target, &ask).len(), 1);

        let resp = serve_bulk_docs(&target, &BulkDocsRequest { docs });
        assert_eq!(resp.failures().count(), 0);
        assert!(serve_revs_diff(&target, &ask).is_empty());
    }
}
