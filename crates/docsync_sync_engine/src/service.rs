//! The sync façade used by applications.

use crate::config::{ReplicationOptions, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::listener::{ChangeListener, FeedNotice, ListenerOptions};
use crate::orchestrator::{StatusSubscription, SyncOrchestrator, SyncStatus};
use crate::provider::RemoteConnectionProvider;
use crate::replica::ReplicaConnector;
use docsync_core::DocumentStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of [`SyncService::initialize`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitReport {
    /// The local store is open.
    pub local_ready: bool,
    /// The remote answered the connectivity probe.
    pub remote_connected: bool,
    /// A replication is running.
    pub sync_active: bool,
    /// Why sync could not be set up, if it could not.
    pub config_error: Option<SyncError>,
}

/// One local store, its remote and the triggers that keep them in sync.
///
/// Construct one per store and share it; every method takes `&self`.
#[derive(Debug)]
pub struct SyncService {
    store: Arc<DocumentStore>,
    config: SyncConfig,
    provider: Arc<RemoteConnectionProvider>,
    orchestrator: SyncOrchestrator,
}

impl SyncService {
    /// Wires a service around `store`. Nothing touches the network until
    /// [`initialize`](Self::initialize) or a sync call.
    pub fn new(
        store: Arc<DocumentStore>,
        config: SyncConfig,
        connector: Arc<dyn ReplicaConnector>,
    ) -> Self {
        let provider = Arc::new(RemoteConnectionProvider::new(
            config.remote.clone(),
            connector,
            config.probe_timeout,
        ));
        let orchestrator =
            SyncOrchestrator::new(Arc::clone(&store), Arc::clone(&provider), config.clone());
        Self {
            store,
            config,
            provider,
            orchestrator,
        }
    }

    /// Probes the remote and, when sync is enabled, starts live sync and the
    /// periodic timer.
    ///
    /// Never fails: configuration problems are reported in the returned
    /// report and the service keeps working offline.
    pub async fn initialize(&self) -> InitReport {
        let local_ready = self.store.is_open();
        let mut report = InitReport {
            local_ready,
            ..InitReport::default()
        };

        if let Err(e) = self.config.validate() {
            warn!(error = %e, "sync misconfigured, running offline");
            report.config_error = Some(e);
            return report;
        }
        if !self.config.enabled {
            info!("sync disabled, running offline");
            return report;
        }

        report.remote_connected = self.provider.test_remote_connection().await;
        if report.remote_connected {
            if let Err(e) = self.orchestrator.start_sync(None).await {
                warn!(error = %e, "initial sync failed");
            }
        } else {
            warn!("remote unreachable, will retry on the periodic timer");
        }
        self.orchestrator.start_periodic();

        report.sync_active = self.orchestrator.get_status().is_active;
        info!(
            local_ready,
            remote_connected = report.remote_connected,
            sync_active = report.sync_active,
            "sync service initialized"
        );
        report
    }

    /// Syncs now. Returns false on failure; the failure is in the status.
    pub async fn sync_now(&self, options: Option<ReplicationOptions>) -> bool {
        match self.orchestrator.start_sync(options).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "sync failed");
                false
            }
        }
    }

    /// Debounced sync for high-frequency triggers such as edits.
    pub async fn debounced_sync(&self, options: Option<ReplicationOptions>) -> bool {
        match self.orchestrator.debounced_sync(options).await {
            Ok(()) => true,
            Err(SyncError::Cancelled) => false,
            Err(e) => {
                warn!(error = %e, "debounced sync failed");
                false
            }
        }
    }

    /// Current status.
    #[must_use]
    pub fn get_sync_status(&self) -> SyncStatus {
        self.orchestrator.get_status()
    }

    /// Observes status changes. See [`SyncOrchestrator::subscribe`].
    pub fn subscribe<F>(&self, handler: F) -> StatusSubscription
    where
        F: FnMut(&SyncStatus) + Send + 'static,
    {
        self.orchestrator.subscribe(handler)
    }

    /// Delivers every local or replicated change to `handler`.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    pub fn watch_changes<F>(
        &self,
        options: ListenerOptions,
        handler: F,
    ) -> SyncResult<ChangeListener>
    where
        F: FnMut(FeedNotice) + Send + 'static,
    {
        ChangeListener::spawn(Arc::clone(&self.store), options, handler)
    }

    /// The local store.
    #[must_use]
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// The orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// The remote connection provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<RemoteConnectionProvider> {
        &self.provider
    }

    /// Stops sync, releases the remote and closes the local store.
    ///
    /// The store is closed, not destroyed: its data stays on disk and the
    /// next open sees every document. Use
    /// [`shutdown_and_destroy`](Self::shutdown_and_destroy) to also delete
    /// the local data.
    pub async fn shutdown(&self) {
        self.orchestrator.stop_sync();
        if let Err(e) = self.provider.close().await {
            warn!(error = %e, "closing remote failed");
        }
        if let Err(e) = self.store.close() {
            warn!(error = %e, "closing store failed");
        }
        info!("sync service shut down");
    }

    /// [`shutdown`](Self::shutdown), then deletes the local store.
    ///
    /// # Errors
    ///
    /// Fails if the store directory cannot be removed, e.g. because another
    /// handle still has it open.
    pub async fn shutdown_and_destroy(&self) -> SyncResult<()> {
        self.shutdown().await;
        if let Some(path) = self.store.path() {
            DocumentStore::destroy(path)?;
            info!(path = %path.display(), "local store destroyed");
        }
        Ok(())
    }
}
