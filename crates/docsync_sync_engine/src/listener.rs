//! Self-restarting change listener.
//!
//! Wraps a live [`Subscription`] on a tokio task and hands every change to a
//! callback. When the subscription fails (the listener fell behind, or the
//! feed closed) the listener waits, subscribes again from "now" and tells
//! the callback that events may have been missed in between. Consumers
//! that need a complete view re-run their query on
//! [`FeedNotice::Restarted`].

use crate::error::SyncResult;
use docsync_core::{ChangeEvent, ChangeOptions, CoreError, DocumentStore, Subscription};
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait before re-subscribing after a feed failure.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// What a listener delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedNotice {
    /// A committed mutation.
    Change(ChangeEvent),
    /// The feed was re-established; mutations from `missed_from` up to the
    /// next delivered change may not have been delivered.
    Restarted {
        /// First sequence that may have been missed.
        missed_from: u64,
    },
}

/// Listener tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Wait before re-subscribing after a failure.
    pub restart_delay: Duration,
    /// Attach documents to change events.
    pub include_docs: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            restart_delay: DEFAULT_RESTART_DELAY,
            include_docs: true,
        }
    }
}

impl ListenerOptions {
    /// Sets the restart delay.
    #[must_use]
    pub const fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Sets whether documents are attached.
    #[must_use]
    pub const fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }
}

// `true` while delivery is allowed. Reentrant so a handler may cancel its
// own listener.
type Gate = Arc<ReentrantMutex<Cell<bool>>>;

/// A running listener. Dropping it cancels it.
#[derive(Debug)]
pub struct ChangeListener {
    gate: Gate,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChangeListener {
    /// Subscribes to `store` from now and starts delivering to `handler`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    pub fn spawn<F>(
        store: Arc<DocumentStore>,
        options: ListenerOptions,
        handler: F,
    ) -> SyncResult<Self>
    where
        F: FnMut(FeedNotice) + Send + 'static,
    {
        let subscription = subscribe(&store, options)?;
        let gate: Gate = Arc::new(ReentrantMutex::new(Cell::new(true)));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(listen(
            store,
            options,
            subscription,
            Arc::clone(&gate),
            cancel.clone(),
            handler,
        ));

        Ok(Self {
            gate,
            cancel,
            task: Some(task),
        })
    }

    /// Stops delivery. No handler call starts after this returns.
    pub fn cancel(&self) {
        let open = self.gate.lock();
        open.set(false);
        self.cancel.cancel();
    }

    /// True until cancelled or stopped by a closed store.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.gate.lock().get() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Waits for the listener task to finish.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn subscribe(store: &DocumentStore, options: ListenerOptions) -> Result<Subscription, CoreError> {
    store.changes(ChangeOptions::live_from_now().include_docs(options.include_docs))
}

fn deliver<F: FnMut(FeedNotice)>(gate: &Gate, handler: &mut F, notice: FeedNotice) -> bool {
    let open = gate.lock();
    if !open.get() {
        return false;
    }
    handler(notice);
    true
}

async fn listen<F>(
    store: Arc<DocumentStore>,
    options: ListenerOptions,
    mut subscription: Subscription,
    gate: Gate,
    cancel: CancellationToken,
    mut handler: F,
) where
    F: FnMut(FeedNotice) + Send + 'static,
{
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => return,
            received = subscription.recv() => received,
        };

        let notice = match received {
            Ok(Some(event)) => FeedNotice::Change(event),
            Ok(None) => return,
            Err(e) => {
                let missed_from = subscription.last_seq() + 1;
                warn!(error = %e, delay = ?options.restart_delay, "change feed failed, restarting");
                match resubscribe(&store, options, &cancel).await {
                    Some(fresh) => subscription = fresh,
                    None => return,
                }
                debug!(missed_from, "change feed restarted");
                FeedNotice::Restarted { missed_from }
            }
        };

        if !deliver(&gate, &mut handler, notice) {
            return;
        }
    }
}

async fn resubscribe(
    store: &DocumentStore,
    options: ListenerOptions,
    cancel: &CancellationToken,
) -> Option<Subscription> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(options.restart_delay) => {}
        }
        match subscribe(store, options) {
            Ok(subscription) => return Some(subscription),
            Err(CoreError::DatabaseClosed) => {
                info!("store closed, change listener stopping");
                return None;
            }
            Err(e) => warn!(error = %e, "change feed restart failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{Document, StoreConfig};
    use parking_lot::Mutex;
    use serde_json::json;

    fn collect() -> (Arc<Mutex<Vec<FeedNotice>>>, impl FnMut(FeedNotice) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |notice| sink.lock().push(notice))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn forwards_changes_in_order() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        store.put(Document::new("before", "note", json!(0))).unwrap();
        let (seen, handler) = collect();
        let listener =
            ChangeListener::spawn(Arc::clone(&store), ListenerOptions::default(), handler).unwrap();

        store.put(Document::new("a", "note", json!(1))).unwrap();
        store.put(Document::new("b", "note", json!(2))).unwrap();
        settle().await;

        let ids: Vec<_> = seen
            .lock()
            .iter()
            .map(|n| match n {
                FeedNotice::Change(e) => e.id.clone(),
                FeedNotice::Restarted { .. } => "restart".into(),
            })
            .collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(listener.is_active());
    }

    #[tokio::test]
    async fn nothing_is_delivered_after_cancel() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let (seen, handler) = collect();
        let listener =
            ChangeListener::spawn(Arc::clone(&store), ListenerOptions::default(), handler).unwrap();

        listener.cancel();
        store.put(Document::new("late", "note", json!(1))).unwrap();
        settle().await;

        assert!(seen.lock().is_empty());
        assert!(!listener.is_active());
    }

    #[tokio::test]
    async fn handler_may_cancel_its_own_listener() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let slot: Arc<Mutex<Option<ChangeListener>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0));

        let (slot2, calls2) = (Arc::clone(&slot), Arc::clone(&calls));
        let handler = move |_| {
            *calls2.lock() += 1;
            if let Some(listener) = slot2.lock().as_ref() {
                listener.cancel();
            }
        };
        let listener =
            ChangeListener::spawn(Arc::clone(&store), ListenerOptions::default(), handler).unwrap();
        *slot.lock() = Some(listener);

        store.put(Document::new("a", "note", json!(1))).unwrap();
        store.put(Document::new("b", "note", json!(2))).unwrap();
        settle().await;

        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_listener_restarts_with_a_gap_notice() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(
            DocumentStore::open_with_config(temp.path(), StoreConfig::default().feed_capacity(2))
                .unwrap(),
        );
        let (seen, handler) = collect();
        let options = ListenerOptions::default().restart_delay(Duration::from_secs(5));
        let _listener = ChangeListener::spawn(Arc::clone(&store), options, handler).unwrap();

        // five commits before the listener task runs overflow its buffer
        for i in 0..5 {
            store.put(Document::new(format!("n{i}"), "note", json!(i))).unwrap();
        }
        settle().await;
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(seen.lock().as_slice(), [FeedNotice::Restarted { missed_from: 1 }]);

        store.put(Document::new("after", "note", json!(9))).unwrap();
        settle().await;
        assert!(matches!(seen.lock().last(), Some(FeedNotice::Change(e)) if e.id == "after"));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_store_stops_the_listener() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let (seen, handler) = collect();
        let listener =
            ChangeListener::spawn(Arc::clone(&store), ListenerOptions::default(), handler).unwrap();

        store.close().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(seen.lock().is_empty());
        assert!(!listener.is_active());
    }
}
