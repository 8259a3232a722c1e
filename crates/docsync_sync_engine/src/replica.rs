//! The replica abstraction and the in-process replica.
//!
//! A replica is any store that takes part in replication: the local
//! [`DocumentStore`], or a remote server reached over HTTP. Replication only
//! ever talks to the [`Replica`] trait, so both directions use the same
//! code and the same optimistic-concurrency rules.

use crate::config::RemoteConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use docsync_core::{is_reserved_kind, Document, DocumentStore, Revision};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identity and position of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Stable identifier, used to key replication checkpoints.
    pub id: String,
    /// Sequence of the replica's latest mutation.
    pub update_seq: u64,
    /// Live documents.
    pub doc_count: usize,
}

/// Latest state of one changed document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Sequence of the document's last mutation.
    pub seq: u64,
    /// Document id.
    pub id: String,
    /// Kind, when the replica reports it.
    pub kind: String,
    /// Current revision.
    pub revision: Revision,
    /// True for tombstones.
    pub deleted: bool,
    /// Current document, absent for tombstones.
    pub document: Option<Document>,
}

/// One page of a changes request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangesPage {
    /// Changed documents, reserved kinds filtered out.
    pub results: Vec<ChangeEntry>,
    /// Sequence to ask from next time.
    pub last_seq: u64,
    /// True when more changes follow this page.
    pub pending: bool,
}

/// A store participating in replication.
#[async_trait]
pub trait Replica: Send + Sync {
    /// Identity and current sequence.
    async fn info(&self) -> SyncResult<ReplicaInfo>;

    /// Documents changed after `since`, at most `limit` per page.
    async fn changes(&self, since: u64, limit: usize) -> SyncResult<ChangesPage>;

    /// Live document with `id`; `None` when absent or deleted.
    async fn get(&self, id: &str) -> SyncResult<Option<Document>>;

    /// Conflict-checked write, same rules as [`DocumentStore::put`].
    async fn put(&self, doc: Document) -> SyncResult<Revision>;

    /// Conflict-checked removal, same rules as [`DocumentStore::remove`].
    async fn remove(&self, id: &str, revision: &Revision) -> SyncResult<Revision>;

    /// Releases the connection. Further calls may fail.
    async fn close(&self) -> SyncResult<()>;
}

/// Builds a replica handle from its configuration.
#[async_trait]
pub trait ReplicaConnector: Send + Sync {
    /// Connects and authenticates.
    async fn connect(&self, config: &RemoteConfig) -> SyncResult<Arc<dyn Replica>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Default)]
struct Policy {
    required: Option<Credentials>,
    denied_kinds: HashSet<String>,
}

/// A [`DocumentStore`] exposed as a replica.
///
/// Serves as the remote side in tests and in store-to-store replication.
/// It can demand credentials, refuse writes to chosen kinds and be switched
/// offline, which makes every call fail with a retryable network error.
#[derive(Clone)]
pub struct LocalReplica {
    store: Arc<DocumentStore>,
    online: Arc<AtomicBool>,
    policy: Arc<RwLock<Policy>>,
    presented: Option<Credentials>,
}

impl std::fmt::Debug for LocalReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalReplica")
            .field("store_id", &self.store.store_id())
            .field("online", &self.online.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LocalReplica {
    /// Wraps a store.
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            online: Arc::new(AtomicBool::new(true)),
            policy: Arc::new(RwLock::new(Policy::default())),
            presented: None,
        }
    }

    /// The wrapped store.
    #[must_use]
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Rejects every call that does not present these credentials.
    pub fn require_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        self.policy.write().required = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
    }

    /// A handle to the same store presenting the given credentials.
    #[must_use]
    pub fn with_credentials(&self, username: Option<&str>, password: Option<&str>) -> Self {
        let presented = username.map(|username| Credentials {
            username: username.to_string(),
            password: password.unwrap_or_default().to_string(),
        });
        Self {
            presented,
            ..self.clone()
        }
    }

    /// Refuses writes to documents of `kind` with [`SyncError::Forbidden`].
    pub fn deny_kind(&self, kind: impl Into<String>) {
        self.policy.write().denied_kinds.insert(kind.into());
    }

    /// Simulates losing or regaining the network. Shared by all handles.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// True unless switched offline.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn check_access(&self) -> SyncResult<()> {
        if !self.is_online() {
            return Err(SyncError::network("replica unreachable"));
        }
        let policy = self.policy.read();
        match &policy.required {
            Some(required) if self.presented.as_ref() != Some(required) => {
                Err(SyncError::Auth("name or password is incorrect".into()))
            }
            _ => Ok(()),
        }
    }

    fn check_write(&self, id: &str, kind: &str) -> SyncResult<()> {
        if self.policy.read().denied_kinds.contains(kind) {
            return Err(SyncError::Forbidden {
                id: id.to_string(),
                reason: format!("writes to kind {kind} are not allowed"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Replica for LocalReplica {
    async fn info(&self) -> SyncResult<ReplicaInfo> {
        self.check_access()?;
        if !self.store.is_open() {
            return Err(SyncError::Storage("store is closed".into()));
        }
        Ok(ReplicaInfo {
            id: self.store.store_id().to_string(),
            update_seq: self.store.update_seq(),
            doc_count: self.store.doc_count(),
        })
    }

    async fn changes(&self, since: u64, limit: usize) -> SyncResult<ChangesPage> {
        self.check_access()?;
        let limit = limit.max(1);
        let mut events = self.store.changes_since(since, limit + 1)?;
        let pending = events.len() > limit;
        events.truncate(limit);

        let last_seq = events.last().map_or(since, |e| e.seq);
        let results = events
            .into_iter()
            .filter(|e| !is_reserved_kind(&e.kind))
            .map(|e| ChangeEntry {
                seq: e.seq,
                id: e.id,
                kind: e.kind,
                revision: e.revision,
                deleted: e.deleted,
                document: e.document,
            })
            .collect();

        Ok(ChangesPage {
            results,
            last_seq,
            pending,
        })
    }

    async fn get(&self, id: &str) -> SyncResult<Option<Document>> {
        self.check_access()?;
        match self.store.get(id) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, doc: Document) -> SyncResult<Revision> {
        self.check_access()?;
        self.check_write(&doc.id, &doc.kind)?;
        Ok(self.store.put(doc)?)
    }

    async fn remove(&self, id: &str, revision: &Revision) -> SyncResult<Revision> {
        self.check_access()?;
        if let Ok(doc) = self.store.get(id) {
            self.check_write(id, &doc.kind)?;
        }
        Ok(self.store.remove(id, revision)?)
    }

    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Connects to a [`LocalReplica`], presenting the configured credentials.
///
/// Stands in for a network connector in tests and store-to-store copies.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    replica: LocalReplica,
}

impl LocalConnector {
    /// Connector that always hands out `replica`.
    pub fn new(replica: LocalReplica) -> Self {
        Self { replica }
    }
}

#[async_trait]
impl ReplicaConnector for LocalConnector {
    async fn connect(&self, config: &RemoteConfig) -> SyncResult<Arc<dyn Replica>> {
        let replica = self
            .replica
            .with_credentials(config.username.as_deref(), config.password.as_deref());
        replica.info().await?;
        Ok(Arc::new(replica))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replica() -> LocalReplica {
        LocalReplica::new(Arc::new(DocumentStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn changes_pages_and_filters_reserved_kinds() {
        let replica = replica();
        let store = replica.store();
        store.put(Document::new("a", "note", json!(1))).unwrap();
        store.put(Document::new("cfg", "_config", json!(1))).unwrap();
        store.put(Document::new("b", "note", json!(1))).unwrap();

        let page = replica.changes(0, 2).await.unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.results[0].id, "a");
        assert_eq!(page.last_seq, 2);
        assert!(page.pending);

        let page = replica.changes(page.last_seq, 2).await.unwrap();
        assert_eq!(page.results[0].id, "b");
        assert_eq!(page.last_seq, 3);
        assert!(!page.pending);

        let page = replica.changes(3, 2).await.unwrap();
        assert!(page.results.is_empty());
        assert_eq!(page.last_seq, 3);
    }

    #[tokio::test]
    async fn get_hides_tombstones() {
        let replica = replica();
        let rev = replica.put(Document::new("a", "note", json!(1))).await.unwrap();
        replica.remove("a", &rev).await.unwrap();
        assert_eq!(replica.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_replica_fails_retryably() {
        let replica = replica();
        replica.set_online(false);
        let err = replica.info().await.unwrap_err();
        assert!(err.is_retryable());

        replica.set_online(true);
        replica.info().await.unwrap();
    }

    #[tokio::test]
    async fn credentials_are_checked() {
        let replica = replica();
        replica.require_credentials("alice", "secret");

        assert!(matches!(replica.info().await, Err(SyncError::Auth(_))));
        let wrong = replica.with_credentials(Some("alice"), Some("guess"));
        assert!(matches!(wrong.info().await, Err(SyncError::Auth(_))));
        let right = replica.with_credentials(Some("alice"), Some("secret"));
        right.info().await.unwrap();
    }

    #[tokio::test]
    async fn denied_kinds_are_forbidden() {
        let replica = replica();
        replica.deny_kind("secret");
        let err = replica
            .put(Document::new("s1", "secret", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Forbidden { ref id, .. } if id == "s1"));
    }

    #[tokio::test]
    async fn connector_presents_configured_credentials() {
        let replica = replica();
        replica.require_credentials("alice", "secret");
        let connector = LocalConnector::new(replica);

        let config = RemoteConfig::new("http://localhost:5984", "notes").unwrap();
        assert!(matches!(
            connector.connect(&config).await,
            Err(SyncError::Auth(_))
        ));

        let config = config.with_credentials("alice", "secret");
        let remote = connector.connect(&config).await.unwrap();
        assert_eq!(remote.info().await.unwrap().update_seq, 0);
    }
}
