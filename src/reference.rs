//! Reference-data cache
//!
//! Keeps a copy of the backend's master data (languages, file types, user
//! roles, ...) in one local-only document per partition. A refresh replaces
//! the snapshot wholesale when the remote content hash differs and writes
//! nothing when it matches. Failures stay here: replication never waits on
//! or hears about this cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::protocol;
use crate::replication::{Backoff, BackoffConfig};
use crate::revision::canonical_json;
use crate::store::{Partition, StoreError};
use crate::transport::{Transport, TransportError};

/// Well-known id of the snapshot document; never replicated
pub const REFERENCE_DOC_ID: &str = "_local/master_data";

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed snapshot: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Unscoped path of the reference endpoint on the backend
    pub endpoint: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/master-data".to_string(),
            max_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

/// The cached dataset plus the hash it was stored under
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    /// Hex SHA-256 of the canonical JSON of `data`
    pub content_hash: String,
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
}

impl ReferenceSnapshot {
    pub fn new(data: Value) -> Self {
        Self {
            content_hash: content_hash(&data),
            data,
            fetched_at: Utc::now(),
        }
    }

    /// Typed view of the payload.
    pub fn master_data(&self) -> Result<MasterData, ReferenceError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ReferenceError::Malformed(e.to_string()))
    }
}

pub fn content_hash(data: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(data)))
}

/// Outcome of a refresh that never fails
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    Unchanged,
    Failed(String),
}

pub struct ReferenceCache {
    partition: Arc<Partition>,
    transport: Arc<dyn Transport>,
    config: ReferenceConfig,
}

impl ReferenceCache {
    pub fn new(partition: Arc<Partition>, transport: Arc<dyn Transport>, config: ReferenceConfig) -> Self {
        Self {
            partition,
            transport,
            config,
        }
    }

    /// The snapshot currently stored, if any
    pub fn snapshot(&self) -> Result<Option<ReferenceSnapshot>, ReferenceError> {
        match self.partition.get(REFERENCE_DOC_ID) {
            Ok(doc) => serde_json::from_value(doc.body)
                .map(Some)
                .map_err(|e| ReferenceError::Malformed(e.to_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn master_data(&self) -> Result<Option<MasterData>, ReferenceError> {
        self.snapshot()?.map(|s| s.master_data()).transpose()
    }

    /// Fetch the remote dataset and store it if it changed.
    ///
    /// Returns whether a write happened. Transient transport failures are
    /// retried up to `max_attempts`.
    pub async fn refresh(&self) -> Result<bool, ReferenceError> {
        let data = self.fetch().await?;
        let hash = content_hash(&data);

        let current = match self.partition.get(REFERENCE_DOC_ID) {
            Ok(doc) => Some(doc),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let stored_hash = current
            .as_ref()
            .and_then(|doc| doc.body.get("content_hash"))
            .and_then(Value::as_str);
        if stored_hash == Some(hash.as_str()) {
            log::debug!("[{}] reference data unchanged ({})", self.partition.id(), &hash[..12]);
            return Ok(false);
        }

        let snapshot = ReferenceSnapshot {
            content_hash: hash,
            data,
            fetched_at: Utc::now(),
        };
        let body = serde_json::to_value(&snapshot).map_err(|e| ReferenceError::Malformed(e.to_string()))?;
        let revision = self
            .partition
            .put(REFERENCE_DOC_ID, current.as_ref().map(|doc| &doc.revision), body)?;
        log::info!("[{}] reference data updated to {}", self.partition.id(), revision);
        Ok(true)
    }

    /// [`refresh`](Self::refresh) with every error logged and swallowed.
    pub async fn refresh_quietly(&self) -> RefreshOutcome {
        match self.refresh().await {
            Ok(true) => RefreshOutcome::Updated,
            Ok(false) => RefreshOutcome::Unchanged,
            Err(e) => {
                log::warn!("[{}] reference data refresh failed: {}", self.partition.id(), e);
                RefreshOutcome::Failed(e.to_string())
            }
        }
    }

    async fn fetch(&self) -> Result<Value, TransportError> {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_ms: self.config.retry_delay_ms,
            max_ms: self.config.retry_delay_ms.saturating_mul(8),
            ..BackoffConfig::default()
        });
        let max_attempts = self.config.max_attempts.max(1);
        loop {
            match protocol::fetch_reference(&*self.transport, &self.config.endpoint).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() && backoff.attempts() + 1 < max_attempts => {
                    let delay: Duration = backoff.next_delay();
                    log::debug!("reference fetch failed ({}), retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ----------------------------------------------------------------------
// Typed view
// ----------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Language {
    pub language_id: i64,
    pub language_short: String,
    pub language_common: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileType {
    pub file_type_id: i64,
    pub type_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileExtension {
    pub extension_id: i64,
    pub extension_text: String,
    pub file_type_id: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRole {
    pub role_id: i64,
    pub role_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkstationUser {
    pub user_id: i64,
    pub display_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterData {
    pub languages: Vec<Language>,
    pub file_types: Vec<FileType>,
    pub file_extensions: Vec<FileExtension>,
    pub user_roles: Vec<UserRole>,
    pub workstation_users: Vec<WorkstationUser>,
}

impl MasterData {
    /// Extensions registered for the file type called `type_name`
    pub fn extensions_for(&self, type_name: &str) -> Vec<&str> {
        let Some(file_type) = self.file_types.iter().find(|t| t.type_name == type_name) else {
            return Vec::new();
        };
        self.file_extensions
            .iter()
            .filter(|e| e.file_type_id == file_type.file_type_id)
            .map(|e| e.extension_text.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, PartitionId, StoreConfig};
    use crate::transport::{Fault, InMemoryPeer};
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "languages": [{"language_id": 1, "language_short": "ja", "language_common": "Japanese"}],
            "file_types": [{"file_type_id": 1, "type_name": "image"}],
            "file_extensions": [
                {"extension_id": 1, "extension_text": "jpg", "file_type_id": 1},
                {"extension_id": 2, "extension_text": "png", "file_type_id": 1}
            ],
            "user_roles": [{"role_id": 1, "role_name": "admin"}],
            "workstation_users": [{"user_id": 7, "display_name": "Field Team"}]
        })
    }

    fn setup() -> (Arc<Partition>, Arc<InMemoryPeer>, ReferenceCache) {
        let partition = LocalStore::in_memory(StoreConfig::default())
            .partition(&PartitionId::for_tenant("db", "1").unwrap())
            .unwrap();
        let peer = Arc::new(InMemoryPeer::new());
        let config = ReferenceConfig {
            retry_delay_ms: 10,
            ..ReferenceConfig::default()
        };
        let cache = ReferenceCache::new(Arc::clone(&partition), peer.clone(), config);
        (partition, peer, cache)
    }

    #[tokio::test]
    async fn test_refresh_twice_writes_once() {
        let (partition, peer, cache) = setup();
        peer.set_reference(sample());

        assert!(cache.refresh().await.unwrap());
        assert_eq!(partition.last_seq(), 1);
        assert!(!cache.refresh().await.unwrap());
        assert_eq!(partition.last_seq(), 1);

        let data = cache.master_data().unwrap().unwrap();
        assert_eq!(data.languages[0].language_short, "ja");
        assert_eq!(data.extensions_for("image"), vec!["jpg", "png"]);
    }

    #[tokio::test]
    async fn test_changed_payload_replaces_snapshot() {
        let (partition, peer, cache) = setup();
        peer.set_reference(sample());
        cache.refresh().await.unwrap();
        let first = cache.snapshot().unwrap().unwrap();

        peer.set_reference(json!({"languages": []}));
        assert!(cache.refresh().await.unwrap());
        let second = cache.snapshot().unwrap().unwrap();
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(second.data, json!({"languages": []}));
        assert_eq!(partition.get(REFERENCE_DOC_ID).unwrap().revision.generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (_, peer, cache) = setup();
        peer.set_reference(sample());
        peer.inject(Fault::Status(503));
        peer.inject(Fault::Unreachable);
        assert!(cache.refresh().await.unwrap());
        assert_eq!(peer.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_swallowed_by_refresh_quietly() {
        let (partition, peer, cache) = setup();
        for _ in 0..3 {
            peer.inject(Fault::Status(500));
        }
        match cache.refresh_quietly().await {
            RefreshOutcome::Failed(message) => assert!(message.contains("500")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(partition.last_seq(), 0);

        // Auth failures are not retried
        peer.require_token(Some("secret"));
        peer.set_reference(sample());
        assert!(matches!(
            cache.refresh().await,
            Err(ReferenceError::Transport(TransportError::AuthRejected(401)))
        ));
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        assert_eq!(
            content_hash(&json!({"a": 1, "b": 2})),
            content_hash(&json!({"b": 2, "a": 1}))
        );
    }
}
