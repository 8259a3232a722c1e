//! Service lifecycle: initialization, manual sync, change watching and
//! shutdown.

use docsync_core::{Document, DocumentStore};
use docsync_sync_engine::{
    ErrorKind, FeedNotice, HttpConnector, ListenerOptions, LocalConnector, LocalReplica,
    LoopbackClient, RemoteConfig, ReplicationOptions, SyncConfig, SyncService,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn remote() -> LocalReplica {
    LocalReplica::new(Arc::new(DocumentStore::open_in_memory().unwrap()))
}

fn remote_config() -> RemoteConfig {
    RemoteConfig::new("http://couch.test:5984", "notes").unwrap()
}

fn service(config: SyncConfig, remote: &LocalReplica) -> SyncService {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    SyncService::new(store, config, Arc::new(LocalConnector::new(remote.clone())))
}

#[tokio::test]
async fn offline_configuration_works_locally() {
    let service = service(SyncConfig::offline(), &remote());

    let report = service.initialize().await;

    assert!(report.local_ready);
    assert!(!report.remote_connected);
    assert!(!report.sync_active);
    assert_eq!(report.config_error, None);

    let doc = service.store().create("note", json!({"title": "offline"})).unwrap();
    assert_eq!(service.store().get(&doc.id).unwrap().content["title"], "offline");
    assert!(!service.sync_now(None).await);
}

#[tokio::test]
async fn enabled_without_remote_reports_a_config_error() {
    let service = service(SyncConfig::default().with_enabled(true), &remote());

    let report = service.initialize().await;

    assert!(report.local_ready);
    assert_eq!(report.config_error.map(|e| e.kind()), Some(ErrorKind::Config));
    assert!(!service.get_sync_status().is_periodic_sync_active);
}

#[tokio::test(start_paused = true)]
async fn initialize_starts_live_sync_when_reachable() {
    let remote = remote();
    remote.store().put(Document::new("r1", "note", json!("server"))).unwrap();
    let service = service(SyncConfig::default().with_remote(remote_config()), &remote);

    let report = service.initialize().await;

    assert!(report.remote_connected);
    assert!(report.sync_active);
    let status = service.get_sync_status();
    assert!(status.is_periodic_sync_active);
    assert!(status.is_remote_connected);
    assert_eq!(service.store().get("r1").unwrap().content, json!("server"));

    service.store().create("note", json!("device")).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(remote.store().doc_count(), 2);

    service.shutdown().await;
    assert!(!service.store().is_open());
    assert!(!service.get_sync_status().is_active);
}

#[tokio::test(start_paused = true)]
async fn initialize_stays_offline_when_unreachable() {
    let remote = remote();
    remote.set_online(false);
    let service = service(
        SyncConfig::default()
            .with_remote(remote_config())
            .with_interval(Duration::from_secs(10)),
        &remote,
    );

    let report = service.initialize().await;

    assert!(!report.remote_connected);
    assert!(!report.sync_active);
    assert!(service.get_sync_status().is_periodic_sync_active);

    // the periodic timer picks the remote up once it is back
    remote.set_online(true);
    service.store().create("note", json!("queued")).unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(remote.store().doc_count(), 1);
    assert!(service.provider().is_remote_connected());
}

#[tokio::test(start_paused = true)]
async fn sync_now_runs_a_one_shot_pass() {
    let remote = remote();
    let service = service(SyncConfig::default().with_remote(remote_config()), &remote);
    service.store().create("note", json!(1)).unwrap();

    assert!(service.sync_now(Some(ReplicationOptions::one_shot())).await);

    assert_eq!(remote.store().doc_count(), 1);
    let status = service.get_sync_status();
    assert!(!status.is_active);
    assert!(status.last_sync.is_some());
}

#[tokio::test]
async fn watch_changes_sees_local_writes() {
    let service = service(SyncConfig::offline(), &remote());
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let listener = service
        .watch_changes(ListenerOptions::default(), move |notice| {
            if let FeedNotice::Change(event) = notice {
                sink.lock().push(event.id);
            }
        })
        .unwrap();

    service.store().put(Document::new("w1", "note", json!(1))).unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(seen.lock().as_slice(), ["w1"]);
    listener.cancel();
}

#[tokio::test]
async fn shutdown_keeps_the_store_on_disk() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("db");
    let store = Arc::new(DocumentStore::open(&path).unwrap());
    let doc = store.create("note", json!("kept")).unwrap();
    let service = SyncService::new(
        store,
        SyncConfig::offline(),
        Arc::new(LocalConnector::new(remote())),
    );

    service.shutdown().await;

    assert!(!service.store().is_open());
    let reopened = DocumentStore::open(&path).unwrap();
    assert_eq!(reopened.get(&doc.id).unwrap().content, json!("kept"));
}

#[tokio::test]
async fn shutdown_and_destroy_removes_the_store() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("db");
    let store = Arc::new(DocumentStore::open(&path).unwrap());
    store.create("note", json!("doomed")).unwrap();
    let service = SyncService::new(
        store,
        SyncConfig::offline(),
        Arc::new(LocalConnector::new(remote())),
    );

    service.shutdown_and_destroy().await.unwrap();

    assert!(!path.exists());
    let reopened = DocumentStore::open(&path).unwrap();
    assert_eq!(reopened.doc_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn service_syncs_over_http_with_credentials() {
    let remote = remote();
    remote.require_credentials("alice", "secret");
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let connector = Arc::new(HttpConnector::new(LoopbackClient::new(remote.clone())));

    let wrong = SyncService::new(
        Arc::clone(&store),
        SyncConfig::default()
            .with_remote(remote_config().with_credentials("alice", "wrong")),
        connector.clone(),
    );
    assert!(!wrong.initialize().await.remote_connected);
    wrong.orchestrator().stop_sync();

    let service = SyncService::new(
        store,
        SyncConfig::default()
            .with_remote(remote_config().with_credentials("alice", "secret"))
            .with_replication(ReplicationOptions::one_shot()),
        connector,
    );
    service.store().create("note", json!("over http")).unwrap();
    assert!(service.initialize().await.remote_connected);
    assert_eq!(remote.store().doc_count(), 1);
}
