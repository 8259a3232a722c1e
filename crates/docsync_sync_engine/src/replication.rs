//! Bidirectional replication between the local store and a remote replica.
//!
//! A replication runs on its own tokio task and moves through
//! `Idle → Connecting → Active ⇄ Paused` until it completes (one-shot),
//! fails without retry (`Error`) or is cancelled (`Stopped`).
//!
//! Each pass alternates between pulling (remote → local) and pushing
//! (local → remote), a bounded number of pages at a time, until both
//! directions are drained. Documents are written through the normal
//! conflict-checked path on the target; a conflict is resolved by
//! re-reading the target and writing again, so the last accepted write wins.

use crate::config::ReplicationOptions;
use crate::error::{SyncError, SyncResult};
use crate::replica::{ChangeEntry, LocalReplica, Replica};
use docsync_core::{ChangeOptions, DocumentStore, FeedError, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Local-record key prefix for replication checkpoints.
pub const CHECKPOINT_PREFIX: &str = "replication/";

const EVENT_CAPACITY: usize = 256;

/// Where a replication is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationState {
    /// Not started.
    #[default]
    Idle,
    /// Reaching the remote.
    Connecting,
    /// Changes are flowing.
    Active,
    /// Both directions drained; waiting for new changes (live only).
    Paused,
    /// Failed; retrying after backoff if the error allows it.
    Error,
    /// Cancelled.
    Stopped,
    /// One-shot replication finished.
    Complete,
}

impl ReplicationState {
    /// True once nothing further will happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Complete)
    }
}

/// Direction of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

/// Progress of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeInfo {
    /// Direction of the page.
    pub direction: Direction,
    /// Changes read from the source.
    pub docs_read: usize,
    /// Changes written to the target.
    pub docs_written: usize,
    /// Source sequence reached.
    pub last_seq: u64,
}

/// Totals over the life of a replication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Changes read in either direction.
    pub docs_read: u64,
    /// Changes written in either direction.
    pub docs_written: u64,
    /// Changes the target already had.
    pub skipped: u64,
    /// Changes the target refused.
    pub denied: u64,
    /// Writes abandoned after exhausting conflict retries.
    pub doc_write_failures: u64,
    /// Remote sequence pulled up to.
    pub pull_seq: u64,
    /// Local sequence pushed up to.
    pub push_seq: u64,
}

/// Something a replication reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// A page was replicated.
    Change(ChangeInfo),
    /// Changes started flowing.
    Active,
    /// Both directions caught up.
    Paused,
    /// The target refused a document; it was skipped.
    Denied {
        /// Document id.
        id: String,
        /// Reason given by the target.
        reason: String,
    },
    /// A one-shot replication finished.
    Complete(ReplicationSummary),
    /// A pass failed.
    Error(SyncError),
}

/// Sequences replicated so far with one remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Remote sequence pulled up to.
    pub pull_seq: u64,
    /// Local sequence pushed up to.
    pub push_seq: u64,
}

impl Checkpoint {
    fn seq(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Pull => self.pull_seq,
            Direction::Push => self.push_seq,
        }
    }

    fn advance(&mut self, direction: Direction, seq: u64) {
        match direction {
            Direction::Pull => self.pull_seq = seq,
            Direction::Push => self.push_seq = seq,
        }
    }
}

/// Reads the checkpoint stored for `remote_id`.
pub fn load_checkpoint(store: &DocumentStore, remote_id: &str) -> SyncResult<Checkpoint> {
    let key = format!("{CHECKPOINT_PREFIX}{remote_id}");
    match store.get_local(&key)? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| SyncError::Storage(format!("unreadable checkpoint {key}: {e}"))),
        None => Ok(Checkpoint::default()),
    }
}

fn save_checkpoint(
    store: &DocumentStore,
    remote_id: &str,
    checkpoint: Checkpoint,
) -> SyncResult<()> {
    let key = format!("{CHECKPOINT_PREFIX}{remote_id}");
    let value = serde_json::to_value(checkpoint)
        .map_err(|e| SyncError::Storage(format!("unencodable checkpoint: {e}")))?;
    store.set_local(&key, value)?;
    Ok(())
}

/// True when a replication running with `options` backs off and tries
/// again after failing with `err`. Exhausted conflict retries count as
/// transient.
pub(crate) fn will_retry(options: &ReplicationOptions, err: &SyncError) -> bool {
    options.retry && (err.is_retryable() || err.is_conflict())
}

struct Shared {
    cancel: CancellationToken,
    // held while emitting, and by cancel(), so nothing is emitted once
    // cancel() has returned
    gate: Mutex<()>,
    events: broadcast::Sender<ReplicationEvent>,
    first_receiver: Mutex<Option<broadcast::Receiver<ReplicationEvent>>>,
    state: watch::Sender<ReplicationState>,
    settled: watch::Sender<Option<SyncResult<ReplicationState>>>,
    summary: Mutex<ReplicationSummary>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: ReplicationEvent) {
        let _gate = self.gate.lock();
        if !self.cancel.is_cancelled() {
            let _ = self.events.send(event);
        }
    }

    fn transition(&self, state: ReplicationState) {
        let _gate = self.gate.lock();
        if !self.cancel.is_cancelled() {
            self.state.send_replace(state);
        }
    }

    fn settle(&self, result: SyncResult<ReplicationState>) {
        self.settled.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    fn settle_unless_cancelled(&self, result: SyncResult<ReplicationState>) {
        let _gate = self.gate.lock();
        if !self.cancel.is_cancelled() {
            self.settle(result);
        }
    }
}

/// Handle to a running replication.
///
/// Clones share the replication; cancelling any clone stops it.
#[derive(Clone)]
pub struct ReplicationHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ReplicationHandle {
    fn new() -> Self {
        let (events, first) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ReplicationState::Idle);
        let (settled, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                cancel: CancellationToken::new(),
                gate: Mutex::new(()),
                events,
                first_receiver: Mutex::new(Some(first)),
                state,
                settled,
                summary: Mutex::new(ReplicationSummary::default()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Stops the replication.
    ///
    /// Safe at any time, including mid-request: an in-flight exchange may
    /// still complete on the remote, but its result is discarded and no
    /// event or state change is emitted after this returns.
    pub fn cancel(&self) {
        let _gate = self.shared.gate.lock();
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        if !self.shared.state.borrow().is_terminal() {
            self.shared.state.send_replace(ReplicationState::Stopped);
        }
        self.shared.settle(Ok(ReplicationState::Stopped));
        info!("replication stopped");
    }

    /// True after [`cancel`](Self::cancel).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the replication is cancelled.
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Receives replication events.
    ///
    /// The first subscriber sees every event since the start; later ones
    /// see events from the moment they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.shared
            .first_receiver
            .lock()
            .take()
            .unwrap_or_else(|| self.shared.events.subscribe())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ReplicationState {
        *self.shared.state.borrow()
    }

    /// Observes state changes.
    pub fn watch_state(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state.subscribe()
    }

    /// Waits for the first pass to settle.
    ///
    /// Resolves `Ok(Paused)` when a live replication first catches up,
    /// `Ok(Complete)` when a one-shot finishes, `Ok(Stopped)` when cancelled
    /// first, and `Err` when the first pass fails.
    pub async fn settled(&self) -> SyncResult<ReplicationState> {
        let mut rx = self.shared.settled.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(SyncError::Cancelled))
    }

    /// Totals so far.
    #[must_use]
    pub fn summary(&self) -> ReplicationSummary {
        self.shared.summary.lock().clone()
    }

    /// Waits for the replication task to end.
    pub async fn join(&self) {
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Runs at most one replication at a time against the local store.
#[derive(Debug)]
pub struct ReplicationManager {
    store: Arc<DocumentStore>,
    current: Mutex<Option<ReplicationHandle>>,
}

impl ReplicationManager {
    /// Creates a manager for `store`.
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    /// Starts replicating with `remote`, cancelling any running replication.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        remote: Arc<dyn Replica>,
        options: ReplicationOptions,
    ) -> ReplicationHandle {
        let handle = ReplicationHandle::new();
        if let Some(previous) = self.current.lock().replace(handle.clone()) {
            previous.cancel();
        }

        let replicator = Replicator {
            shared: Arc::clone(&handle.shared),
            store: Arc::clone(&self.store),
            local: Arc::new(LocalReplica::new(Arc::clone(&self.store))),
            remote,
            options,
        };
        let task = tokio::spawn(replicator.run());
        *handle.shared.task.lock() = Some(task);
        handle
    }

    /// Cancels the running replication, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.current.lock().take() {
            handle.cancel();
        }
    }

    /// The most recently started replication, unless stopped.
    #[must_use]
    pub fn current(&self) -> Option<ReplicationHandle> {
        self.current.lock().clone()
    }
}

enum Applied {
    Written,
    Skipped,
    Denied,
}

struct Replicator {
    shared: Arc<Shared>,
    store: Arc<DocumentStore>,
    local: Arc<dyn Replica>,
    remote: Arc<dyn Replica>,
    options: ReplicationOptions,
}

impl Replicator {
    async fn run(self) {
        let cancel = self.shared.cancel.clone();
        let shared = Arc::clone(&self.shared);
        let limit = self.options.timeout;

        let work = async {
            match limit {
                Some(limit) => {
                    if tokio::time::timeout(limit, self.replicate()).await.is_err() {
                        warn!(?limit, "replication timed out");
                        shared.transition(ReplicationState::Error);
                        shared.emit(ReplicationEvent::Error(SyncError::Timeout));
                        shared.settle_unless_cancelled(Err(SyncError::Timeout));
                    }
                }
                None => self.replicate().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => {}
            () = work => {}
        }
    }

    async fn replicate(&self) {
        let mut failures: u32 = 0;
        let mut feed: Option<Subscription> = None;
        self.shared.transition(ReplicationState::Connecting);
        info!(live = self.options.live, "replication starting");

        loop {
            if self.options.live && feed.is_none() {
                // subscribe before the pass so writes made during it wake us
                feed = self
                    .store
                    .changes(ChangeOptions::live_from_now().include_docs(false))
                    .ok();
            }

            match self.pass().await {
                Ok(()) => {
                    failures = 0;
                    if !self.options.live {
                        let summary = self.shared.summary.lock().clone();
                        info!(
                            docs_read = summary.docs_read,
                            docs_written = summary.docs_written,
                            "replication complete"
                        );
                        self.shared.transition(ReplicationState::Complete);
                        self.shared.emit(ReplicationEvent::Complete(summary));
                        self.shared.settle_unless_cancelled(Ok(ReplicationState::Complete));
                        return;
                    }
                    if *self.shared.state.borrow() != ReplicationState::Paused {
                        debug!("replication paused");
                        self.shared.transition(ReplicationState::Paused);
                        self.shared.emit(ReplicationEvent::Paused);
                    }
                    self.shared.settle_unless_cancelled(Ok(ReplicationState::Paused));
                    self.wait_for_work(&mut feed).await;
                }
                Err(e) => {
                    self.shared.transition(ReplicationState::Error);
                    self.shared.emit(ReplicationEvent::Error(e.clone()));
                    self.shared.settle_unless_cancelled(Err(e.clone()));

                    if !will_retry(&self.options, &e) {
                        error!(error = %e, "replication failed");
                        return;
                    }
                    failures = failures.saturating_add(1);
                    let delay = self.options.backoff.delay_for_attempt(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        ?delay,
                        "replication pass failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    self.shared.transition(ReplicationState::Connecting);
                }
            }
        }
    }

    async fn wait_for_work(&self, feed: &mut Option<Subscription>) {
        let heartbeat = tokio::time::sleep(self.options.heartbeat);
        let Some(sub) = feed.as_mut() else {
            heartbeat.await;
            return;
        };

        tokio::select! {
            received = sub.recv() => match received {
                Ok(Some(_)) | Err(FeedError::Lagged { .. }) => {
                    // coalesce whatever else is already queued
                    while let Ok(Some(_)) = sub.try_recv() {}
                }
                Ok(None) | Err(FeedError::Closed) => *feed = None,
            },
            () = heartbeat => {}
        }
    }

    async fn pass(&self) -> SyncResult<()> {
        let info = self.remote.info().await?;
        let mut checkpoint = load_checkpoint(&self.store, &info.id)?;
        if info.update_seq < checkpoint.pull_seq {
            warn!(
                remote = %info.id,
                checkpoint = checkpoint.pull_seq,
                update_seq = info.update_seq,
                "remote sequence went backwards, pulling from the start"
            );
            checkpoint.pull_seq = 0;
        }

        loop {
            let pulled = self.run_direction(Direction::Pull, &info.id, &mut checkpoint).await?;
            let pushed = self.run_direction(Direction::Push, &info.id, &mut checkpoint).await?;
            if pulled && pushed {
                return Ok(());
            }
        }
    }

    /// Replicates up to `batches_limit` pages; true when the source drained.
    async fn run_direction(
        &self,
        direction: Direction,
        remote_id: &str,
        checkpoint: &mut Checkpoint,
    ) -> SyncResult<bool> {
        let (source, target) = match direction {
            Direction::Pull => (&self.remote, &self.local),
            Direction::Push => (&self.local, &self.remote),
        };

        for _ in 0..self.options.batches_limit {
            let since = checkpoint.seq(direction);
            let page = source.changes(since, self.options.batch_size).await?;
            let docs_read = page.results.len();
            if docs_read > 0 {
                self.enter_active();
            }

            let mut docs_written = 0;
            for entry in &page.results {
                if let Applied::Written = self.apply(target.as_ref(), entry).await? {
                    docs_written += 1;
                }
            }

            // idle heartbeats leave the journal untouched
            if page.last_seq != since {
                checkpoint.advance(direction, page.last_seq);
                save_checkpoint(&self.store, remote_id, *checkpoint)?;
            }
            {
                let mut summary = self.shared.summary.lock();
                summary.docs_read += docs_read as u64;
                summary.docs_written += docs_written as u64;
                summary.pull_seq = checkpoint.pull_seq;
                summary.push_seq = checkpoint.push_seq;
            }

            if docs_read > 0 {
                debug!(
                    ?direction,
                    docs_read,
                    docs_written,
                    last_seq = page.last_seq,
                    "replicated batch"
                );
                self.shared.emit(ReplicationEvent::Change(ChangeInfo {
                    direction,
                    docs_read,
                    docs_written,
                    last_seq: page.last_seq,
                }));
            }
            if !page.pending {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn enter_active(&self) {
        if *self.shared.state.borrow() == ReplicationState::Active {
            return;
        }
        debug!("replication active");
        self.shared.transition(ReplicationState::Active);
        self.shared.emit(ReplicationEvent::Active);
    }

    async fn apply(&self, target: &dyn Replica, entry: &ChangeEntry) -> SyncResult<Applied> {
        if docsync_core::is_reserved_kind(&entry.kind) {
            return Ok(self.skipped());
        }

        let mut attempt = 0;
        loop {
            let current = target.get(&entry.id).await?;
            let result = match (&entry.document, current) {
                (_, None) if entry.deleted => return Ok(self.skipped()),
                (_, Some(current)) if entry.deleted => match current.revision {
                    Some(rev) => target.remove(&entry.id, &rev).await.map(drop),
                    None => return Ok(self.skipped()),
                },
                (Some(doc), Some(current)) if current.same_body(doc) => return Ok(self.skipped()),
                (Some(doc), current) => {
                    let mut doc = doc.clone();
                    doc.revision = current.and_then(|c| c.revision);
                    target.put(doc).await.map(drop)
                }
                (None, _) => {
                    return Err(SyncError::Protocol(format!(
                        "change for {} carries no document",
                        entry.id
                    )));
                }
            };

            match result {
                Ok(()) => return Ok(Applied::Written),
                Err(SyncError::Forbidden { id, reason }) => {
                    warn!(id = %id, reason = %reason, "document denied by target");
                    self.shared.summary.lock().denied += 1;
                    self.shared.emit(ReplicationEvent::Denied { id, reason });
                    return Ok(Applied::Denied);
                }
                Err(e @ (SyncError::Conflict { .. } | SyncError::NotFound { .. })) => {
                    if attempt >= self.options.conflict_retries {
                        self.shared.summary.lock().doc_write_failures += 1;
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = self.options.backoff.delay_for_attempt(attempt);
                    debug!(id = %entry.id, attempt, ?delay, "write conflicted, re-reading target");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn skipped(&self) -> Applied {
        self.shared.summary.lock().skipped += 1;
        Applied::Skipped
    }
}
