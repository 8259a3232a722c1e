//! Network transport for [`HttpReplica`](crate::HttpReplica).

use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

/// Per-request timeout used by [`ReqwestClient::new`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An [`HttpClient`] over real connections, pooled by `reqwest`.
///
/// Cloning is cheap and clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with [`DEFAULT_REQUEST_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if the TLS backend cannot be initialised.
    pub fn new() -> SyncResult<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a client whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if the TLS backend cannot be initialised.
    pub fn with_timeout(timeout: Duration) -> SyncResult<Self> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| SyncError::config(format!("cannot build http client: {e}")))?;
        Ok(Self { inner })
    }

    /// Wraps an already configured client.
    #[must_use]
    pub fn from_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.inner.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        trace!(status, len = body.len(), "http response");
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
