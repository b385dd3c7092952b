//! Bearer credentials
//!
//! The caller owns credential storage and refresh. A [`CredentialProvider`]
//! is asked for the current token on every request, so rotating it takes
//! effect on the next call without restarting replication.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{PeerRequest, PeerResponse, Transport, TransportError};

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The token to send right now, or `None` to send the request bare.
    async fn bearer_token(&self) -> Option<String>;
}

/// A fixed token
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A token the caller can replace at any time; clones share the same slot.
#[derive(Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(token.into()))),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl CredentialProvider for SharedToken {
    async fn bearer_token(&self) -> Option<String> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Wraps a transport and adds `Authorization: Bearer <token>` to every request.
pub struct BearerAuth<T> {
    inner: T,
    credentials: Arc<dyn CredentialProvider>,
}

impl<T: Transport> BearerAuth<T> {
    pub fn new(inner: T, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { inner, credentials }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for BearerAuth<T> {
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        let request = match self.credentials.bearer_token().await {
            Some(token) => request.with_header("Authorization", format!("Bearer {}", token)),
            None => request,
        };
        self.inner.send(request).await
    }
}
