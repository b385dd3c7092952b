//! HTTP transport over reqwest

use std::time::Duration;

use async_trait::async_trait;

use super::{Method, PeerRequest, PeerResponse, Transport, TransportError};

/// Sends requests to `{base_url}{db_path}/{partition}/{path}`, or to
/// `{base_url}{path}` for unscoped requests.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    db_path: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        db_path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Transient(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            db_path: normalize_path(&db_path.into()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `request`, without the query string
    pub fn url_for(&self, request: &PeerRequest) -> String {
        let path = request.path.trim_start_matches('/');
        match &request.partition {
            Some(partition) => format!("{}{}/{}/{}", self.base_url, self.db_path, partition, path),
            None => format!("{}/{}", self.base_url, path),
        }
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        let url = self.url_for(&request);
        log::trace!("{:?} {}", request.method, url);

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("request to {url} failed: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Transient(format!("failed to read body from {url}: {e}")))?;

        Ok(PeerResponse::new(status, body.to_vec()))
    }
}
