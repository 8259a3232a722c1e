//! # docsync sync engine
//!
//! Keeps a local [`docsync_core::DocumentStore`] in sync with a remote
//! replica.
//!
//! This crate provides:
//! - the [`Replica`] abstraction, with an in-process [`LocalReplica`] and a
//!   CouchDB-style [`HttpReplica`] carried by [`ReqwestClient`]
//! - [`RemoteConnectionProvider`], lazy remote construction and probing
//! - [`ReplicationManager`], bidirectional live replication with retry and
//!   backoff
//! - [`ChangeListener`], a change subscription that restarts itself
//! - [`SyncOrchestrator`], debounced, periodic and manual triggers with an
//!   observable [`SyncStatus`]
//! - [`SyncService`], the façade tying them together
//!
//! ## Key Invariants
//!
//! - Replication writes through the same conflict-checked path as any
//!   caller; the last accepted write wins
//! - Documents with reserved kinds never leave the store they were
//!   written to
//! - The local store works with no remote configured or reachable
//! - Nothing is emitted by a replication or listener once cancelled

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod listener;
mod orchestrator;
mod provider;
mod replica;
mod replication;
mod service;
mod transport;

pub use config::{
    BackoffConfig, RemoteConfig, ReplicationOptions, SyncConfig, DEFAULT_DATABASE,
    ENV_REMOTE_DB, ENV_REMOTE_PASSWORD, ENV_REMOTE_URL, ENV_REMOTE_USERNAME, ENV_SYNC_ENABLED,
    ENV_SYNC_INTERVAL_MS,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use http::{
    HttpClient, HttpConnector, HttpReplica, HttpRequest, HttpResponse, LoopbackClient, Method,
};
pub use listener::{ChangeListener, FeedNotice, ListenerOptions, DEFAULT_RESTART_DELAY};
pub use orchestrator::{OrchestratorStats, StatusSubscription, SyncOrchestrator, SyncStatus};
pub use provider::RemoteConnectionProvider;
pub use replica::{
    ChangeEntry, ChangesPage, LocalConnector, LocalReplica, Replica, ReplicaConnector, ReplicaInfo,
};
pub use replication::{
    load_checkpoint, ChangeInfo, Checkpoint, Direction, ReplicationEvent, ReplicationHandle,
    ReplicationManager, ReplicationState, ReplicationSummary, CHECKPOINT_PREFIX,
};
pub use service::{InitReport, SyncService};
pub use transport::{ReqwestClient, DEFAULT_REQUEST_TIMEOUT};
