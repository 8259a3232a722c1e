//! Lazy construction of the remote replica handle.

use crate::config::RemoteConfig;
use crate::error::{SyncError, SyncResult};
use crate::replica::{Replica, ReplicaConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Builds the remote handle on first use and probes connectivity.
///
/// Nothing touches the network until [`remote`](Self::remote) or
/// [`test_remote_connection`](Self::test_remote_connection) is called, so a
/// store without remote configuration works fully offline.
pub struct RemoteConnectionProvider {
    config: Option<RemoteConfig>,
    connector: Arc<dyn ReplicaConnector>,
    remote: Mutex<Option<Arc<dyn Replica>>>,
    connected: AtomicBool,
    probe_timeout: Duration,
}

impl std::fmt::Debug for RemoteConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnectionProvider")
            .field("config", &self.config)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteConnectionProvider {
    /// Creates a provider. `config` is `None` when no remote is configured.
    pub fn new(
        config: Option<RemoteConfig>,
        connector: Arc<dyn ReplicaConnector>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            config,
            connector,
            remote: Mutex::new(None),
            connected: AtomicBool::new(false),
            probe_timeout,
        }
    }

    /// True when a remote is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// The remote handle, constructing it on first call.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] without remote configuration; otherwise whatever
    /// the connector reports. A failed attempt is not cached.
    pub async fn remote(&self) -> SyncResult<Arc<dyn Replica>> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SyncError::config("no remote configured"))?;

        let mut slot = self.remote.lock().await;
        if let Some(remote) = slot.as_ref() {
            return Ok(Arc::clone(remote));
        }

        match self.connector.connect(config).await {
            Ok(remote) => {
                info!(url = %config.url, database = %config.database, "connected to remote");
                self.connected.store(true, Ordering::SeqCst);
                *slot = Some(Arc::clone(&remote));
                Ok(remote)
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, "remote connection failed");
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Result of the last construction or probe. Not a live check.
    #[must_use]
    pub fn is_remote_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fetches remote metadata to check the remote is reachable.
    ///
    /// Never fails: any error, or no answer within the probe timeout, is
    /// reported as `false`.
    pub async fn test_remote_connection(&self) -> bool {
        let probe = async {
            let remote = self.remote().await?;
            remote.info().await
        };
        let reachable = match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(info)) => {
                debug!(remote = %info.id, update_seq = info.update_seq, "remote probe succeeded");
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "remote probe failed");
                false
            }
            Err(_) => {
                debug!(timeout = ?self.probe_timeout, "remote probe timed out");
                false
            }
        };
        self.connected.store(reachable, Ordering::SeqCst);
        reachable
    }

    /// Drops the remote handle. The next [`remote`](Self::remote) call
    /// reconnects.
    pub async fn close(&self) -> SyncResult<()> {
        let remote = self.remote.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(remote) = remote {
            remote.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{LocalConnector, LocalReplica};
    use async_trait::async_trait;
    use docsync_core::DocumentStore;
    use std::sync::atomic::AtomicUsize;

    struct CountingConnector {
        inner: LocalConnector,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ReplicaConnector for CountingConnector {
        async fn connect(&self, config: &RemoteConfig) -> SyncResult<Arc<dyn Replica>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect(config).await
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl ReplicaConnector for HangingConnector {
        async fn connect(&self, _config: &RemoteConfig) -> SyncResult<Arc<dyn Replica>> {
            std::future::pending().await
        }
    }

    fn remote_config() -> RemoteConfig {
        RemoteConfig::new("http://localhost:5984", "notes").unwrap()
    }

    fn local() -> LocalReplica {
        LocalReplica::new(Arc::new(DocumentStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn unconfigured_provider_is_offline() {
        let provider = RemoteConnectionProvider::new(
            None,
            Arc::new(LocalConnector::new(local())),
            Duration::from_secs(1),
        );
        assert!(!provider.is_configured());
        assert!(matches!(provider.remote().await, Err(SyncError::Config(_))));
        assert!(!provider.test_remote_connection().await);
    }

    #[tokio::test]
    async fn remote_is_built_once() {
        let connector = Arc::new(CountingConnector {
            inner: LocalConnector::new(local()),
            connects: AtomicUsize::new(0),
        });
        let provider = RemoteConnectionProvider::new(
            Some(remote_config()),
            connector.clone(),
            Duration::from_secs(1),
        );

        assert!(!provider.is_remote_connected());
        provider.remote().await.unwrap();
        provider.remote().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(provider.is_remote_connected());

        provider.close().await.unwrap();
        assert!(!provider.is_remote_connected());
        provider.remote().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn probe_fails_soft() {
        let replica = local();
        let provider = RemoteConnectionProvider::new(
            Some(remote_config()),
            Arc::new(LocalConnector::new(replica.clone())),
            Duration::from_secs(1),
        );
        assert!(provider.test_remote_connection().await);

        replica.set_online(false);
        assert!(!provider.test_remote_connection().await);
        assert!(!provider.is_remote_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_is_bounded_by_timeout() {
        let provider = RemoteConnectionProvider::new(
            Some(remote_config()),
            Arc::new(HangingConnector),
            Duration::from_secs(5),
        );
        assert!(!provider.test_remote_connection().await);
    }
}
