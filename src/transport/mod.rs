//! Transport to a remote peer
//!
//! The replication engine talks to its peer only through [`Transport::send`].
//! A transport moves one request and returns the raw status and body; the
//! caller decides what a status means via [`PeerResponse::error_for_status`].
//! Credentials are attached by wrapping a transport in [`BearerAuth`], so the
//! engine never sees them.

pub mod auth;
pub mod http;
pub mod memory;

pub use auth::{BearerAuth, CredentialProvider, SharedToken, StaticToken};
pub use http::HttpTransport;
pub use memory::{Fault, InMemoryPeer};

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::store::PartitionId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transient transport failure: {0}")]
    Transient(String),

    #[error("Credential rejected (HTTP {0})")]
    AuthRejected(u16),

    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Timeouts, resets and overloaded peers
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Retrying with the same credential cannot succeed.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, TransportError::AuthRejected(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outbound request.
///
/// `partition` selects the peer database the path is relative to; unscoped
/// requests address the backend root (the reference-data endpoint, for one).
#[derive(Clone, Debug)]
pub struct PeerRequest {
    pub method: Method,
    pub partition: Option<PartitionId>,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl PeerRequest {
    fn new(method: Method, partition: Option<PartitionId>, path: impl Into<String>) -> Self {
        Self {
            method,
            partition,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(partition: &PartitionId, path: impl Into<String>) -> Self {
        Self::new(Method::Get, Some(partition.clone()), path)
    }

    /// POST with a JSON body.
    pub fn post_json<T: Serialize>(
        partition: &PartitionId,
        path: impl Into<String>,
        body: &T,
    ) -> Result<Self, TransportError> {
        let bytes = serde_json::to_vec(body).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let mut request = Self::new(Method::Post, Some(partition.clone()), path);
        request.body = Some(bytes);
        Ok(request.with_header("Content-Type", "application/json"))
    }

    /// GET against the backend root rather than a partition.
    pub fn unscoped_get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, None, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Set a header, replacing any previous value with the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl PeerResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        // Serializing wire types into a Vec cannot fail
        Self::new(status, serde_json::to_vec(value).unwrap_or_default())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map a non-success status onto the error taxonomy.
    ///
    /// 401/403 mean the credential was refused; 408, 429 and 5xx are worth
    /// retrying; anything else is a rejection of this particular request.
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        match self.status {
            s if (200..300).contains(&s) => Ok(self),
            401 | 403 => Err(TransportError::AuthRejected(self.status)),
            408 | 429 | 500..=599 => Err(TransportError::Transient(format!(
                "peer answered HTTP {}",
                self.status
            ))),
            status => Err(TransportError::Rejected {
                status,
                message: String::from_utf8_lossy(&self.body).chars().take(200).collect(),
            }),
        }
    }

    /// Decode the body, classifying failures as [`TransportError::Malformed`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Moves requests to a peer. Implementations own connection handling and
/// must be safe to share between the push and pull loops.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and return the peer's raw answer.
    ///
    /// Only failures to get any answer at all (connection refused, timeout)
    /// are errors here; HTTP error statuses come back as a `PeerResponse`.
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        (**self).send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let ok = PeerResponse::new(200, b"{}".to_vec());
        assert!(ok.error_for_status().is_ok());

        assert_eq!(
            PeerResponse::new(401, vec![]).error_for_status().unwrap_err(),
            TransportError::AuthRejected(401)
        );
        assert!(PeerResponse::new(403, vec![]).error_for_status().unwrap_err().is_auth_rejected());
        for status in [408, 429, 500, 502, 503] {
            assert!(PeerResponse::new(status, vec![]).error_for_status().unwrap_err().is_transient());
        }
        assert!(matches!(
            PeerResponse::new(404, b"missing".to_vec()).error_for_status(),
            Err(TransportError::Rejected { status: 404, .. })
        ));
    }

    #[test]
    fn test_decode_failure_is_malformed() {
        let resp = PeerResponse::new(200, b"not json".to_vec());
        let decoded: Result<serde_json::Value, _> = resp.decode();
        assert!(matches!(decoded, Err(TransportError::Malformed(_))));
    }

    #[test]
    fn test_header_replaces_case_insensitively() {
        let ws = PartitionId::new("db_ws_1").unwrap();
        let req = PeerRequest::get(&ws, "_changes")
            .with_header("authorization", "Bearer old")
            .with_header("Authorization", "Bearer new");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("AUTHORIZATION"), Some("Bearer new"));
    }
}
