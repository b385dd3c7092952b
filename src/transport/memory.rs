//! In-process remote peer
//!
//! `InMemoryPeer` plays the backend: it owns its own [`LocalStore`], answers
//! the replication endpoints and the reference-data endpoint, and can be told
//! to misbehave. Used by integration tests and for offline demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Method, PeerRequest, PeerResponse, Transport, TransportError};
use crate::protocol::{
    self, BulkDocsRequest, RevsDiff, BULK_DOCS_PATH, CHANGES_PATH, REVS_DIFF_PATH,
};
use crate::store::{LocalStore, Partition, PartitionId, StoreConfig, StoreError};

/// A misbehaviour applied to the next request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this HTTP status and an empty body
    Status(u16),
    /// Answer 200 with a body that is not valid JSON
    Malformed,
    /// Fail without any answer, like a dropped connection
    Unreachable,
}

pub struct InMemoryPeer {
    store: LocalStore,
    reference_path: String,
    reference: RwLock<Option<Value>>,
    required_token: RwLock<Option<String>>,
    faults: Mutex<VecDeque<Fault>>,
    latency: Mutex<Duration>,
    requests: AtomicUsize,
    received: AtomicUsize,
    pushed: AtomicUsize,
}

impl Default for InMemoryPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPeer {
    pub fn new() -> Self {
        Self {
            store: LocalStore::in_memory(StoreConfig {
                allow_branches: true,
                sync_writes: false,
            }),
            reference_path: "/api/master-data".to_string(),
            reference: RwLock::new(None),
            required_token: RwLock::new(None),
            faults: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            requests: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            pushed: AtomicUsize::new(0),
        }
    }

    /// Serve the reference dataset on `path` instead of `/api/master-data`.
    pub fn with_reference_path(mut self, path: impl Into<String>) -> Self {
        self.reference_path = path.into();
        self
    }

    /// The peer's own copy of a partition, for writing "remote" edits directly.
    pub fn partition(&self, id: &PartitionId) -> Result<Arc<Partition>, StoreError> {
        self.store.partition(id)
    }

    pub fn set_reference(&self, data: Value) {
        *self.reference.write().unwrap_or_else(|e| e.into_inner()) = Some(data);
    }

    /// Require `Authorization: Bearer <token>`; `None` accepts anything.
    pub fn require_token(&self, token: Option<&str>) {
        *self.required_token.write().unwrap_or_else(|e| e.into_inner()) = token.map(str::to_string);
    }

    /// Queue a fault for an upcoming request. Faults are consumed in order.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).push_back(fault);
    }

    /// Delay applied to every request. Uses tokio time, so paused test
    /// clocks advance through it instantly.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Requests received so far, including failed ones
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Revisions sent in `_bulk_docs` bodies, counting re-sends
    pub fn received_count(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Revisions newly stored through `_bulk_docs`
    pub fn pushed_count(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }

    fn authorized(&self, request: &PeerRequest) -> bool {
        match &*self.required_token.read().unwrap_or_else(|e| e.into_inner()) {
            Some(token) => {
                request.header("Authorization") == Some(format!("Bearer {}", token).as_str())
            }
            None => true,
        }
    }

    fn route(&self, request: &PeerRequest) -> Result<PeerResponse, StoreError> {
        let Some(partition_id) = &request.partition else {
            if request.method == Method::Get && request.path == self.reference_path {
                let reference = self.reference.read().unwrap_or_else(|e| e.into_inner()).clone();
                return Ok(match reference {
                    Some(data) => PeerResponse::json(200, &data),
                    None => PeerResponse::new(404, b"no reference data".to_vec()),
                });
            }
            return Ok(PeerResponse::new(404, b"not found".to_vec()));
        };

        let partition = self.store.partition(partition_id)?;
        let path = request.path.trim_start_matches('/');
        let response = match (request.method, path) {
            (Method::Get, CHANGES_PATH) => {
                let since = parse_param(request, "since").unwrap_or(0);
                let limit = parse_param(request, "limit").unwrap_or(usize::MAX as u64) as usize;
                PeerResponse::json(200, &protocol::serve_changes(&partition, since, limit)?)
            }
            (Method::Post, REVS_DIFF_PATH) => match decode_body::<RevsDiff>(request) {
                Some(diff) => PeerResponse::json(200, &protocol::serve_revs_diff(&partition, &diff)),
                None => PeerResponse::new(400, b"bad request".to_vec()),
            },
            (Method::Post, BULK_DOCS_PATH) => match decode_body::<BulkDocsRequest>(request) {
                Some(bulk) => {
                    self.received.fetch_add(bulk.docs.len(), Ordering::SeqCst);
                    let before = partition.last_seq();
                    let response = protocol::serve_bulk_docs(&partition, &bulk);
                    let stored = (partition.last_seq() - before) as usize;
                    self.pushed.fetch_add(stored, Ordering::SeqCst);
                    PeerResponse::json(201, &response)
                }
                None => PeerResponse::new(400, b"bad request".to_vec()),
            },
            _ => PeerResponse::new(404, b"not found".to_vec()),
        };
        Ok(response)
    }
}

fn parse_param(request: &PeerRequest, key: &str) -> Option<u64> {
    request.query_param(key).and_then(|v| v.parse().ok())
}

fn decode_body<T: serde::de::DeserializeOwned>(request: &PeerRequest) -> Option<T> {
    request
        .body
        .as_deref()
        .and_then(|body| serde_json::from_slice(body).ok())
}

#[async_trait]
impl Transport for InMemoryPeer {
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = self.faults.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match fault {
            Some(Fault::Status(status)) => return Ok(PeerResponse::new(status, Vec::new())),
            Some(Fault::Malformed) => return Ok(PeerResponse::new(200, b"{\"results\": [".to_vec())),
            Some(Fault::Unreachable) => {
                return Err(TransportError::Transient("connection reset by peer".to_string()))
            }
            None => {}
        }

        if !self.authorized(&request) {
            return Ok(PeerResponse::new(401, b"unauthorized".to_vec()));
        }

        self.route(&request).or_else(|e| {
            log::warn!("in-memory peer failed to serve {}: {}", request.path, e);
            Ok(PeerResponse::new(500, e.to_string().into_bytes()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_serves_changes_for_partition() {
        let peer = InMemoryPeer::new();
        let ws = PartitionId::new("db_ws_1").unwrap();
        peer.partition(&ws).unwrap().put("a", None, json!({"v": 1})).unwrap();

        let resp = protocol::fetch_changes(&peer, &ws, 0, 10).await.unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.last_seq, 1);
        assert_eq!(peer.request_count(), 1);
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let peer = InMemoryPeer::new();
        let ws = PartitionId::new("db_ws_1").unwrap();
        peer.inject(Fault::Status(503));
        peer.inject(Fault::Malformed);
        peer.inject(Fault::Unreachable);

        let first = protocol::fetch_changes(&peer, &ws, 0, 10).await.unwrap_err();
        assert!(first.is_transient());
        let second = protocol::fetch_changes(&peer, &ws, 0, 10).await.unwrap_err();
        assert!(matches!(second, TransportError::Malformed(_)));
        let third = protocol::fetch_changes(&peer, &ws, 0, 10).await.unwrap_err();
        assert!(third.is_transient());
        assert!(protocol::fetch_changes(&peer, &ws, 0, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_token_required() {
        let peer = InMemoryPeer::new();
        peer.require_token(Some("secret"));
        let ws = PartitionId::new("db_ws_1").unwrap();

        let err = protocol::fetch_changes(&peer, &ws, 0, 10).await.unwrap_err();
        assert_eq!(err, TransportError::AuthRejected(401));

        let ok = peer
            .send(PeerRequest::get(&ws, CHANGES_PATH).with_header("Authorization", "Bearer secret"))
            .await
            .unwrap();
        assert_eq!(ok.status, 200);
    }

    #[tokio::test]
    async fn test_bulk_docs_counts_resends() {
        let peer = InMemoryPeer::new();
        let ws = PartitionId::new("db_ws_1").unwrap();
        let source = LocalStore::in_memory(StoreConfig::default());
        let source = source.partition(&ws).unwrap();
        source.put("a", None, json!({"v": 1})).unwrap();
        let docs = source.leaf_revisions("a").unwrap();

        for _ in 0..2 {
            protocol::bulk_docs(&peer, &ws, docs.clone()).await.unwrap();
        }
        assert_eq!(peer.received_count(), 2);
        assert_eq!(peer.pushed_count(), 1);
    }

    #[tokio::test]
    async fn test_reference_endpoint() {
        let peer = InMemoryPeer::new();
        assert!(protocol::fetch_reference(&peer, "/api/master-data").await.is_err());
        peer.set_reference(json!({"languages": []}));
        let data = protocol::fetch_reference(&peer, "/api/master-data").await.unwrap();
        assert_eq!(data, json!({"languages": []}));
    }
}
