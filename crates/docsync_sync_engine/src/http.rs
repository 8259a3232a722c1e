//! HTTP replica.
//!
//! Talks to a CouchDB-style document server:
//!
//! | Route | Use |
//! |---|---|
//! | `GET /{db}` | identity and update sequence |
//! | `GET /{db}/_changes?since=S&limit=N&include_docs=true` | change pages |
//! | `GET /{db}/{id}` | current document |
//! | `PUT /{db}/{id}` | conflict-checked write, `_rev` in the body |
//! | `DELETE /{db}/{id}?rev=R` | conflict-checked removal |
//!
//! The HTTP client itself is abstracted by [`HttpClient`]: requests go over
//! the network through [`ReqwestClient`](crate::ReqwestClient), or stay
//! in-process through [`LoopbackClient`].

use crate::config::RemoteConfig;
use crate::error::{SyncError, SyncResult};
use crate::replica::{
    ChangeEntry, ChangesPage, LocalReplica, Replica, ReplicaConnector, ReplicaInfo,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use docsync_core::{Document, Revision};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// HTTP method used by the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL, query included.
    pub url: Url,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Value of the first header called `name` (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Response with a JSON body.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        Self {
            status,
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// `send` fails with a message only when no response was received at all;
/// error statuses are ordinary responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        (**self).send(request).await
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
    update_seq: u64,
    #[serde(default)]
    doc_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRev {
    rev: Revision,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireChange {
    seq: u64,
    id: String,
    #[serde(default)]
    kind: String,
    changes: Vec<WireRev>,
    #[serde(default)]
    deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    doc: Option<Document>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireChanges {
    results: Vec<WireChange>,
    last_seq: u64,
    #[serde(default)]
    pending: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireWrite {
    ok: bool,
    id: String,
    rev: Revision,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

/// A remote database reached over HTTP.
pub struct HttpReplica<C: HttpClient> {
    client: C,
    db_url: Url,
    authorization: Option<String>,
    open: AtomicBool,
}

impl<C: HttpClient> std::fmt::Debug for HttpReplica<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReplica")
            .field("db_url", &self.db_url.as_str())
            .field("authenticated", &self.authorization.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: HttpClient> HttpReplica<C> {
    /// Creates a replica for `config.database` under `config.url`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if the URL cannot carry a database path.
    pub fn new(config: &RemoteConfig, client: C) -> SyncResult<Self> {
        let mut db_url = config.url.clone();
        db_url.set_query(None);
        db_url.set_fragment(None);
        db_url
            .path_segments_mut()
            .map_err(|()| SyncError::config(format!("remote url {} cannot be a base", config.url)))?
            .pop_if_empty()
            .push(&config.database);

        let authorization = config.username.as_ref().map(|user| {
            let password = config.password.as_deref().unwrap_or_default();
            format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
        });

        Ok(Self {
            client,
            db_url,
            authorization,
            open: AtomicBool::new(true),
        })
    }

    /// URL of the remote database.
    #[must_use]
    pub fn db_url(&self) -> &Url {
        &self.db_url
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.db_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> SyncResult<HttpResponse> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SyncError::network_fatal("replica closed"));
        }
        if !self.client.is_healthy() {
            return Err(SyncError::network("http client unavailable"));
        }

        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        if let Some(auth) = &self.authorization {
            headers.push(("Authorization".to_string(), auth.clone()));
        }

        debug!(?method, url = %url, "http request");
        self.client
            .send(HttpRequest {
                method,
                url,
                headers,
                body,
            })
            .await
            .map_err(SyncError::network)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
        id: &str,
    ) -> SyncResult<T> {
        let response = self.send(method, url, body).await?;
        let response = check_status(response, id)?;
        decode(&response.body)
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| SyncError::Protocol(format!("undecodable response: {e}")))
}

fn check_status(response: HttpResponse, id: &str) -> SyncResult<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let detail: WireError = serde_json::from_slice(&response.body).unwrap_or_default();
    let reason = if detail.reason.is_empty() {
        detail.error
    } else {
        detail.reason
    };
    let id = id.to_string();
    Err(match response.status {
        401 => SyncError::Auth(reason),
        403 => SyncError::Forbidden { id, reason },
        404 => SyncError::NotFound { id },
        409 => SyncError::Conflict { id },
        500..=599 => SyncError::network(format!("server error {}: {reason}", response.status)),
        status => SyncError::Protocol(format!("unexpected status {status}: {reason}")),
    })
}

#[async_trait]
impl<C: HttpClient> Replica for HttpReplica<C> {
    async fn info(&self) -> SyncResult<ReplicaInfo> {
        let info: WireInfo = self.fetch(Method::Get, self.db_url.clone(), None, "").await?;
        Ok(ReplicaInfo {
            id: info.instance_id.unwrap_or_else(|| self.db_url.to_string()),
            update_seq: info.update_seq,
            doc_count: info.doc_count,
        })
    }

    async fn changes(&self, since: u64, limit: usize) -> SyncResult<ChangesPage> {
        let mut url = self.url(&["_changes"]);
        url.query_pairs_mut()
            .append_pair("since", &since.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair("include_docs", "true");
        let page: WireChanges = self.fetch(Method::Get, url, None, "").await?;

        let mut results = Vec::with_capacity(page.results.len());
        for change in page.results {
            let revision = change
                .changes
                .into_iter()
                .next()
                .map(|r| r.rev)
                .ok_or_else(|| {
                    SyncError::Protocol(format!("change for {} has no revision", change.id))
                })?;
            if !change.deleted && change.doc.is_none() {
                return Err(SyncError::Protocol(format!(
                    "change for {} has no document",
                    change.id
                )));
            }
            let kind = change.doc.as_ref().map_or(change.kind, |d| d.kind.clone());
            if docsync_core::is_reserved_kind(&kind) {
                continue;
            }
            results.push(ChangeEntry {
                seq: change.seq,
                id: change.id,
                kind,
                revision,
                deleted: change.deleted,
                document: change.doc,
            });
        }

        Ok(ChangesPage {
            results,
            last_seq: page.last_seq,
            pending: page.pending > 0,
        })
    }

    async fn get(&self, id: &str) -> SyncResult<Option<Document>> {
        match self.fetch(Method::Get, self.url(&[id]), None, id).await {
            Ok(doc) => Ok(Some(doc)),
            Err(SyncError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, doc: Document) -> SyncResult<Revision> {
        let body = serde_json::to_vec(&doc)
            .map_err(|e| SyncError::Protocol(format!("unencodable document: {e}")))?;
        let url = self.url(&[doc.id.as_str()]);
        let written: WireWrite = self.fetch(Method::Put, url, Some(body), &doc.id).await?;
        Ok(written.rev)
    }

    async fn remove(&self, id: &str, revision: &Revision) -> SyncResult<Revision> {
        let mut url = self.url(&[id]);
        url.query_pairs_mut().append_pair("rev", revision.as_str());
        let written: WireWrite = self.fetch(Method::Delete, url, None, id).await?;
        Ok(written.rev)
    }

    async fn close(&self) -> SyncResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Connects [`HttpReplica`]s through a shared client.
#[derive(Debug, Clone)]
pub struct HttpConnector<C> {
    client: C,
}

impl<C: HttpClient + Clone + 'static> HttpConnector<C> {
    /// Connector handing `client` to every replica it builds.
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient + Clone + 'static> ReplicaConnector for HttpConnector<C> {
    async fn connect(&self, config: &RemoteConfig) -> SyncResult<Arc<dyn Replica>> {
        let replica = HttpReplica::new(config, self.client.clone())?;
        // first contact authenticates and proves the database exists
        replica.info().await?;
        Ok(Arc::new(replica))
    }
}

/// An in-process HTTP client that serves the replica routes from a
/// [`LocalReplica`].
///
/// Serves one database at the root of any URL. Basic credentials in the
/// request are presented to the replica, and an offline replica looks
/// like an unreachable host.
#[derive(Debug, Clone)]
pub struct LoopbackClient {
    replica: LocalReplica,
}

impl LoopbackClient {
    /// Creates a client backed by `replica`.
    pub fn new(replica: LocalReplica) -> Self {
        Self { replica }
    }

    fn authenticated(&self, request: &HttpRequest) -> LocalReplica {
        let credentials = request
            .header("Authorization")
            .and_then(|h| h.strip_prefix("Basic "))
            .and_then(|b| BASE64.decode(b).ok())
            .and_then(|raw| String::from_utf8(raw).ok());
        match credentials.as_deref().and_then(|c| c.split_once(':')) {
            Some((user, password)) => self.replica.with_credentials(Some(user), Some(password)),
            None => self.replica.with_credentials(None, None),
        }
    }

    async fn route(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let replica = self.authenticated(request);
        let segments: Vec<String> = request
            .url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
            .collect();
        let query = |name: &str| {
            request
                .url
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };

        match (request.method, segments.as_slice()) {
            (Method::Get, [_db]) => {
                let info = replica.info().await?;
                Ok(HttpResponse::json(
                    200,
                    &WireInfo {
                        instance_id: Some(info.id),
                        update_seq: info.update_seq,
                        doc_count: info.doc_count,
                    },
                ))
            }
            (Method::Get, [_db, changes]) if changes == "_changes" => {
                let since = query("since").and_then(|s| s.parse().ok()).unwrap_or(0);
                let limit = query("limit").and_then(|s| s.parse().ok()).unwrap_or(usize::MAX - 1);
                let page = replica.changes(since, limit).await?;
                let results = page
                    .results
                    .into_iter()
                    .map(|c| WireChange {
                        seq: c.seq,
                        id: c.id,
                        kind: c.kind,
                        changes: vec![WireRev { rev: c.revision }],
                        deleted: c.deleted,
                        doc: c.document,
                    })
                    .collect();
                Ok(HttpResponse::json(
                    200,
                    &WireChanges {
                        results,
                        last_seq: page.last_seq,
                        pending: u64::from(page.pending),
                    },
                ))
            }
            (Method::Get, [_db, id]) => match replica.get(id).await? {
                Some(doc) => Ok(HttpResponse::json(200, &doc)),
                None => Err(SyncError::NotFound { id: id.clone() }),
            },
            (Method::Put, [_db, id]) => {
                let body = request.body.as_deref().unwrap_or_default();
                let mut doc: Document = serde_json::from_slice(body)
                    .map_err(|e| SyncError::Protocol(format!("bad document: {e}")))?;
                doc.id = id.clone();
                let rev = replica.put(doc).await?;
                Ok(HttpResponse::json(
                    201,
                    &WireWrite {
                        ok: true,
                        id: id.clone(),
                        rev,
                    },
                ))
            }
            (Method::Delete, [_db, id]) => {
                let rev = query("rev").ok_or_else(|| SyncError::Conflict { id: id.clone() })?;
                let rev = replica.remove(id, &Revision::from(rev)).await?;
                Ok(HttpResponse::json(
                    200,
                    &WireWrite {
                        ok: true,
                        id: id.clone(),
                        rev,
                    },
                ))
            }
            _ => Err(SyncError::Protocol(format!(
                "no route for {:?} {}",
                request.method,
                request.url.path()
            ))),
        }
    }
}

fn error_response(err: &SyncError) -> HttpResponse {
    let (status, error) = match err {
        SyncError::Auth(_) => (401, "unauthorized"),
        SyncError::Forbidden { .. } => (403, "forbidden"),
        SyncError::NotFound { .. } => (404, "not_found"),
        SyncError::Conflict { .. } => (409, "conflict"),
        SyncError::Protocol(_) => (400, "bad_request"),
        _ => (500, "internal_server_error"),
    };
    let reason = match err {
        SyncError::Auth(reason) | SyncError::Forbidden { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    HttpResponse::json(
        status,
        &WireError {
            error: error.to_string(),
            reason,
        },
    )
}

#[async_trait]
impl HttpClient for LoopbackClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        if !self.replica.is_online() {
            return Err("connection refused".to_string());
        }
        match self.route(&request).await {
            Ok(response) => Ok(response),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
