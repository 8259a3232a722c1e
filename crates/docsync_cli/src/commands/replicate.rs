//! Replicate command implementation.

use super::open_existing;
use docsync_core::DocumentStore;
use docsync_sync_engine::{
    HttpConnector, LocalReplica, RemoteConfig, Replica, ReplicaConnector, ReplicationManager,
    ReplicationOptions, ReplicationSummary, ReqwestClient,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

async fn replicate_once(
    local: &Arc<DocumentStore>,
    remote: Arc<dyn Replica>,
) -> CliResult<ReplicationSummary> {
    let manager = ReplicationManager::new(Arc::clone(local));
    let handle = manager.start(remote, ReplicationOptions::one_shot().with_retry(false));
    handle.settled().await?;
    Ok(handle.summary())
}

fn print_summary(from: &Path, to: &str, summary: &ReplicationSummary) {
    println!("Replicated {} <-> {to}", from.display());
    println!("  Docs read:     {}", summary.docs_read);
    println!("  Docs written:  {}", summary.docs_written);
    println!("  Skipped:       {}", summary.skipped);
    if summary.denied > 0 {
        println!("  Denied:        {}", summary.denied);
    }
}

/// Runs the replicate command: one non-live pass in both directions.
pub fn run(path: &Path, to: &Path) -> CliResult<()> {
    let local = Arc::new(open_existing(path)?);
    let remote = Arc::new(DocumentStore::open(to)?);

    info!(from = %path.display(), to = %to.display(), "replicating");
    let replica = Arc::new(LocalReplica::new(Arc::clone(&remote)));
    let summary = runtime()?.block_on(replicate_once(&local, replica))?;

    local.close()?;
    remote.close()?;

    print_summary(path, &to.display().to_string(), &summary);
    Ok(())
}

/// Runs the sync command: one non-live pass in both directions with a
/// remote database reached over HTTP.
pub fn run_remote(path: &Path, remote: &RemoteConfig) -> CliResult<()> {
    let local = Arc::new(open_existing(path)?);
    let connector = HttpConnector::new(ReqwestClient::new()?);

    info!(from = %path.display(), url = %remote.url, database = %remote.database, "syncing");
    let summary = runtime()?.block_on(async {
        let replica = connector.connect(remote).await?;
        replicate_once(&local, replica).await
    })?;

    local.close()?;

    print_summary(path, &format!("{} ({})", remote.url, remote.database), &summary);
    Ok(())
}
