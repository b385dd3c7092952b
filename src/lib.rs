// Fieldsync - Local-first document sync for field observation records

pub mod config;
pub mod feed;
pub mod protocol;
pub mod record;
pub mod reference;
pub mod replication;
pub mod revision;
pub mod store;
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use feed::ChangeSubscription;
pub use reference::{ReferenceCache, ReferenceConfig, RefreshOutcome, REFERENCE_DOC_ID};
pub use replication::{
    ReplicationConfig, ReplicationError, ReplicationState, Replicator, SyncSummary,
};
pub use revision::{Revision, RevisionRef};
pub use store::{
    ChangeEntry, Document, LocalStore, Order, Partition, PartitionId, StoreConfig, StoreError,
};
pub use transport::{BearerAuth, HttpTransport, Transport, TransportError};
