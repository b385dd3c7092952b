//! Bidirectional replication with a remote peer
//!
//! A [`Replicator`] pairs one local partition with one peer. It runs a push
//! loop following the partition's change feed and a pull loop polling the
//! peer's `_changes`, each resuming from a persisted [`Checkpoint`].

pub mod backoff;
pub mod checkpoint;
mod replicator;

pub use backoff::{Backoff, BackoffConfig};
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use replicator::{Replicator, SyncSummary};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Change-feed entries per push round trip, and rows per pull page
    pub batch_size: usize,
    /// Pause between pulls once caught up with the peer
    pub poll_interval_ms: u64,
    /// Run continuously; when false, callers use one-shot sync
    pub live: bool,
    /// Attempts per request in one-shot sync before giving up
    pub one_shot_max_attempts: u32,
    pub request_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            poll_interval_ms: 5_000,
            live: true,
            one_shot_max_attempts: 5,
            request_timeout_ms: 30_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What kind of failure put the replicator into `Error`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retried automatically after backoff
    Transient,
    /// Credential refused; halts until restarted with a fresh credential
    AuthRejected,
    /// Local failure (store or checkpoint I/O); halts
    Fatal,
}

impl ErrorClass {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ErrorClass::Transient)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    Stopped,
    Starting,
    /// Entries are flowing in at least one direction
    Active,
    /// Both directions are caught up
    Paused,
    Error(ErrorClass),
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationState::Stopped => f.write_str("stopped"),
            ReplicationState::Starting => f.write_str("starting"),
            ReplicationState::Active => f.write_str("active"),
            ReplicationState::Paused => f.write_str("paused"),
            ReplicationState::Error(class) => write!(f, "error ({:?})", class),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Peer refused documents: {0}")]
    PeerRefused(String),

    #[error("Replication is already running")]
    AlreadyRunning,

    #[error("Replication was stopped")]
    Stopped,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ReplicationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReplicationError::Transport(TransportError::AuthRejected(_)) => ErrorClass::AuthRejected,
            ReplicationError::Transport(_) => ErrorClass::Transient,
            ReplicationError::PeerRefused(_) => ErrorClass::Transient,
            // A revision that fails verification came off the wire damaged
            ReplicationError::Store(StoreError::InvalidRevision(_)) => ErrorClass::Transient,
            ReplicationError::Store(_) => ErrorClass::Fatal,
            ReplicationError::Checkpoint(_) => ErrorClass::Fatal,
            ReplicationError::AlreadyRunning | ReplicationError::Stopped => ErrorClass::Fatal,
            ReplicationError::Task(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.class().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let auth: ReplicationError = TransportError::AuthRejected(401).into();
        assert_eq!(auth.class(), ErrorClass::AuthRejected);
        assert!(auth.is_terminal());

        let transient: ReplicationError = TransportError::Transient("reset".into()).into();
        assert!(!transient.is_terminal());
        let malformed: ReplicationError = TransportError::Malformed("eof".into()).into();
        assert_eq!(malformed.class(), ErrorClass::Transient);

        let io: ReplicationError = StoreError::Io("disk full".into()).into();
        assert_eq!(io.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ReplicationConfig = serde_json::from_str(r#"{"batch_size": 10}"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.backoff, BackoffConfig::default());
    }
}
