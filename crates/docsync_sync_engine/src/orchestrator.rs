//! Sync orchestration: manual, debounced and periodic triggers plus an
//! observable [`SyncStatus`].

use crate::config::{ReplicationOptions, SyncConfig};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::provider::RemoteConnectionProvider;
use crate::replication::{will_retry, ReplicationEvent, ReplicationHandle, ReplicationManager};
use chrono::{DateTime, Utc};
use docsync_core::DocumentStore;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Process-wide sync status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    /// A replication is running (connecting, active, paused or retrying).
    pub is_active: bool,
    /// The periodic timer is armed.
    pub is_periodic_sync_active: bool,
    /// The last connection attempt or exchange with the remote succeeded.
    pub is_remote_connected: bool,
    /// When a pass last caught up.
    pub last_sync: Option<DateTime<Utc>>,
    /// Most recent failure, cleared by the next success.
    pub error: Option<SyncError>,
}

/// Trigger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Calls that reached [`SyncOrchestrator::start_sync`].
    pub sync_starts: u64,
    /// Calls to [`SyncOrchestrator::debounced_sync`].
    pub debounced_requests: u64,
    /// Periodic timer firings.
    pub periodic_ticks: u64,
    /// Failed connection attempts and failed passes.
    pub failures: u64,
}

type StatusHandler = Box<dyn FnMut(&SyncStatus) + Send>;

struct Subscriber {
    // version of the last status delivered
    seen: u64,
    handler: StatusHandler,
}

#[derive(Default)]
struct Debounce {
    seq: u64,
    timer: Option<JoinHandle<()>>,
    outcome: Option<broadcast::Sender<SyncResult<()>>>,
}

struct Inner {
    config: SyncConfig,
    provider: Arc<RemoteConnectionProvider>,
    manager: ReplicationManager,

    status: Mutex<(u64, SyncStatus)>,
    // true while this thread is fanning out; nested publishes only enqueue
    delivery: ReentrantMutex<Cell<bool>>,
    pending: Mutex<VecDeque<(u64, SyncStatus)>>,
    subscribers: Mutex<Vec<(u64, Arc<Mutex<Subscriber>>)>>,
    next_subscriber: AtomicU64,

    // bumped by every start and stop; stale tasks compare and bail out
    generation: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    debounce: Mutex<Debounce>,
    stats: Mutex<OrchestratorStats>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Applies `mutate` and delivers the result to every subscriber.
    ///
    /// With `generation`, nothing happens unless it is still current.
    fn publish(&self, generation: Option<u64>, mutate: impl FnOnce(&mut SyncStatus)) {
        let delivering = self.delivery.lock();
        if generation.is_some_and(|g| !self.is_current(g)) {
            return;
        }
        {
            let mut status = self.status.lock();
            let mut next = status.1.clone();
            mutate(&mut next);
            if next == status.1 {
                return;
            }
            status.0 += 1;
            status.1 = next;
            self.pending.lock().push_back(status.clone());
        }
        if delivering.get() {
            return;
        }

        delivering.set(true);
        loop {
            let Some((version, snapshot)) = self.pending.lock().pop_front() else {
                break;
            };
            let subscribers: Vec<_> = self
                .subscribers
                .lock()
                .iter()
                .map(|(_, s)| Arc::clone(s))
                .collect();
            for subscriber in subscribers {
                let mut subscriber = subscriber.lock();
                if subscriber.seen < version {
                    subscriber.seen = version;
                    (subscriber.handler)(&snapshot);
                }
            }
        }
        delivering.set(false);
    }

    fn count(&self, update: impl FnOnce(&mut OrchestratorStats)) {
        update(&mut *self.stats.lock());
    }
}

/// Coordinates sync triggers against one local store and one remote.
///
/// Cheap to clone; clones share state. At most one replication runs at a
/// time: starting another cancels the first.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("status", &self.get_status())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Creates an orchestrator. Nothing runs until a trigger is called.
    pub fn new(
        store: Arc<DocumentStore>,
        provider: Arc<RemoteConnectionProvider>,
        config: SyncConfig,
    ) -> Self {
        let status = SyncStatus {
            is_remote_connected: provider.is_remote_connected(),
            ..SyncStatus::default()
        };
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                manager: ReplicationManager::new(store),
                status: Mutex::new((0, status)),
                delivery: ReentrantMutex::new(Cell::new(false)),
                pending: Mutex::new(VecDeque::new()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                monitor: Mutex::new(None),
                periodic: Mutex::new(None),
                debounce: Mutex::new(Debounce::default()),
                stats: Mutex::new(OrchestratorStats::default()),
            }),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Starts a replication and waits for its first pass to settle.
    ///
    /// `options` defaults to the configured replication options. Resolves
    /// once the pass catches up (live) or completes (one-shot).
    ///
    /// # Errors
    ///
    /// - [`SyncError::Config`] when sync is disabled or has no remote
    /// - the connection or replication error that ended the first pass
    /// - [`SyncError::Cancelled`] when stopped or superseded first
    pub async fn start_sync(&self, options: Option<ReplicationOptions>) -> SyncResult<()> {
        let inner = &self.inner;
        inner.count(|s| s.sync_starts += 1);
        if !inner.config.enabled {
            return Err(SyncError::config("sync is disabled"));
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let options = options.unwrap_or_else(|| inner.config.replication.clone());
        inner.publish(Some(generation), |s| s.is_active = true);

        let remote = match inner.provider.remote().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "cannot reach remote");
                inner.count(|s| s.failures += 1);
                inner.publish(Some(generation), |s| {
                    s.is_active = false;
                    s.is_remote_connected = false;
                    s.error = Some(e.clone());
                });
                return Err(e);
            }
        };
        if !inner.is_current(generation) {
            return Err(SyncError::Cancelled);
        }

        let handle = inner.manager.start(remote, options.clone());
        if !inner.is_current(generation) {
            handle.cancel();
            return Err(SyncError::Cancelled);
        }
        let events = handle.subscribe();
        let (settled_tx, settled_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            Arc::downgrade(inner),
            generation,
            handle,
            events,
            options,
            settled_tx,
        ));
        if let Some(previous) = inner.monitor.lock().replace(monitor) {
            previous.abort();
        }

        settled_rx.await.unwrap_or(Err(SyncError::Cancelled))
    }

    /// Collapses a burst of calls into one [`start_sync`](Self::start_sync).
    ///
    /// Each call restarts the quiet window; the sync runs once the window
    /// passes with no further call, and every caller in the burst receives
    /// its outcome.
    ///
    /// # Errors
    ///
    /// The shared outcome, or [`SyncError::Cancelled`] if
    /// [`stop_sync`](Self::stop_sync) ran first.
    pub async fn debounced_sync(&self, options: Option<ReplicationOptions>) -> SyncResult<()> {
        let mut outcome = {
            let mut debounce = self.inner.debounce.lock();
            self.inner.count(|s| s.debounced_requests += 1);
            debounce.seq += 1;
            if let Some(timer) = debounce.timer.take() {
                timer.abort();
            }
            let outcome = debounce
                .outcome
                .get_or_insert_with(|| broadcast::channel(1).0)
                .subscribe();

            let seq = debounce.seq;
            let weak = Arc::downgrade(&self.inner);
            let delay = self.inner.config.debounce;
            debounce.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let sender = {
                    let mut debounce = inner.debounce.lock();
                    if debounce.seq != seq {
                        return;
                    }
                    debounce.timer = None;
                    debounce.outcome.take()
                };
                debug!("debounce window elapsed, syncing");
                let result = SyncOrchestrator { inner }.start_sync(options).await;
                if let Some(sender) = sender {
                    let _ = sender.send(result);
                }
            }));
            outcome
        };

        outcome.recv().await.unwrap_or(Err(SyncError::Cancelled))
    }

    /// Arms the periodic timer. Returns false when sync is disabled or the
    /// interval is zero.
    ///
    /// Each tick calls [`start_sync`](Self::start_sync); failures are logged
    /// and the timer keeps going.
    pub fn start_periodic(&self) -> bool {
        let interval = self.inner.config.interval;
        if !self.inner.config.enabled || interval.is_zero() {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.count(|s| s.periodic_ticks += 1);
                debug!("periodic sync tick");
                if let Err(e) = (SyncOrchestrator { inner }).start_sync(None).await {
                    warn!(error = %e, "periodic sync failed");
                }
            }
        });
        if let Some(previous) = self.inner.periodic.lock().replace(task) {
            previous.abort();
        }
        info!(?interval, "periodic sync armed");
        self.inner.publish(None, |s| s.is_periodic_sync_active = true);
        true
    }

    /// Cancels the replication, the periodic timer and any pending
    /// debounced call. Idempotent.
    pub fn stop_sync(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.manager.stop();
        if let Some(monitor) = inner.monitor.lock().take() {
            monitor.abort();
        }
        if let Some(periodic) = inner.periodic.lock().take() {
            periodic.abort();
        }
        {
            let mut debounce = inner.debounce.lock();
            debounce.seq += 1;
            if let Some(timer) = debounce.timer.take() {
                timer.abort();
            }
            debounce.outcome = None;
        }
        inner.publish(None, |s| {
            s.is_active = false;
            s.is_periodic_sync_active = false;
        });
        debug!("sync stopped");
    }

    /// Current status.
    #[must_use]
    pub fn get_status(&self) -> SyncStatus {
        self.inner.status.lock().1.clone()
    }

    /// Trigger counters.
    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        *self.inner.stats.lock()
    }

    /// The running replication, if any.
    #[must_use]
    pub fn replication(&self) -> Option<ReplicationHandle> {
        self.inner.manager.current()
    }

    /// Calls `handler` with the current status now and with every later
    /// status, in order. Delivery is synchronous and follows subscription
    /// order.
    pub fn subscribe<F>(&self, handler: F) -> StatusSubscription
    where
        F: FnMut(&SyncStatus) + Send + 'static,
    {
        let _delivering = self.inner.delivery.lock();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (version, current) = self.inner.status.lock().clone();

        let mut subscriber = Subscriber {
            seen: version,
            handler: Box::new(handler),
        };
        (subscriber.handler)(&current);
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::new(Mutex::new(subscriber))));

        StatusSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }
}

/// Registration returned by [`SyncOrchestrator::subscribe`]. Dropping it
/// unsubscribes.
#[derive(Debug)]
pub struct StatusSubscription {
    inner: Weak<Inner>,
    id: u64,
}

impl StatusSubscription {
    /// Stops delivery to this handler. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
        self.inner = Weak::new();
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Turns replication events into status updates and reports the first
/// settle to `start_sync`.
async fn monitor(
    weak: Weak<Inner>,
    generation: u64,
    handle: ReplicationHandle,
    mut events: broadcast::Receiver<ReplicationEvent>,
    options: ReplicationOptions,
    settled: oneshot::Sender<SyncResult<()>>,
) {
    let mut settled = Some(settled);
    let mut settle = |result: SyncResult<()>| {
        if let Some(tx) = settled.take() {
            let _ = tx.send(result);
        }
    };

    loop {
        let received = tokio::select! {
            () = handle.cancelled() => return,
            received = events.recv() => received,
        };
        let event = match received {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "status monitor lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };

        match event {
            ReplicationEvent::Active => inner.publish(Some(generation), |s| {
                s.is_active = true;
                s.is_remote_connected = true;
                s.error = None;
            }),
            ReplicationEvent::Paused => {
                inner.publish(Some(generation), |s| {
                    s.is_active = true;
                    s.is_remote_connected = true;
                    s.last_sync = Some(Utc::now());
                    s.error = None;
                });
                settle(Ok(()));
            }
            ReplicationEvent::Complete(summary) => {
                info!(
                    docs_read = summary.docs_read,
                    docs_written = summary.docs_written,
                    "sync complete"
                );
                inner.publish(Some(generation), |s| {
                    s.is_active = false;
                    s.is_remote_connected = true;
                    s.last_sync = Some(Utc::now());
                    s.error = None;
                });
                settle(Ok(()));
                return;
            }
            ReplicationEvent::Error(e) => {
                let retrying = will_retry(&options, &e);
                let unreachable = matches!(
                    e.kind(),
                    ErrorKind::Network | ErrorKind::Auth | ErrorKind::Timeout
                );
                inner.count(|s| s.failures += 1);
                inner.publish(Some(generation), |s| {
                    s.is_active = retrying;
                    if unreachable {
                        s.is_remote_connected = false;
                    }
                    s.error = Some(e.clone());
                });
                settle(Err(e));
                if !retrying {
                    return;
                }
            }
            ReplicationEvent::Denied { id, reason } => {
                debug!(id = %id, reason = %reason, "document denied");
            }
            ReplicationEvent::Change(info) => {
                debug!(direction = ?info.direction, docs = info.docs_read, "sync progress");
            }
        }
    }
}
