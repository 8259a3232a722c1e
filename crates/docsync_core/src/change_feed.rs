//! Change feed for observing committed mutations.
//!
//! Every committed put or remove, whether written locally or applied by
//! replication, produces exactly one [`ChangeEvent`]. Events are published
//! while the store's write lock is held, so every subscriber sees them in
//! commit order.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = DocumentStore::open_in_memory()?;
//! let mut sub = store.changes(ChangeOptions::live_from_now())?;
//!
//! store.put(Document::new("n1", "note", json!("A")))?;
//! let event = sub.recv().await?.unwrap();
//! assert_eq!(event.id, "n1");
//! ```

use crate::document::{Document, Revision};
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::broadcast;

/// A single committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Store sequence of the commit.
    pub seq: u64,
    /// Document id.
    pub id: String,
    /// Revision issued by the commit.
    pub revision: Revision,
    /// Kind of the document.
    pub kind: String,
    /// True for removals.
    pub deleted: bool,
    /// Document as written. `None` for removals, and for subscribers that
    /// did not ask for documents.
    pub document: Option<Document>,
}

/// Where a subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Since {
    /// Only mutations committed after subscribing.
    #[default]
    Now,
    /// Everything after this store sequence, then live.
    Sequence(u64),
}

/// Options for [`crate::DocumentStore::changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeOptions {
    /// Starting point.
    pub since: Since,
    /// Keep delivering after the backlog drains.
    pub live: bool,
    /// Attach the written document to each event.
    pub include_docs: bool,
}

impl Default for ChangeOptions {
    fn default() -> Self {
        Self {
            since: Since::Now,
            live: true,
            include_docs: true,
        }
    }
}

impl ChangeOptions {
    /// `{since: now, live: true}`.
    #[must_use]
    pub fn live_from_now() -> Self {
        Self::default()
    }

    /// Sets the starting point.
    #[must_use]
    pub const fn since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    /// Sets live delivery.
    #[must_use]
    pub const fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Sets whether events carry documents.
    #[must_use]
    pub const fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }
}

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FeedError {
    /// The subscriber fell behind and events were dropped.
    #[error("change subscription lagged, {skipped} events skipped")]
    Lagged {
        /// Number of events lost.
        skipped: u64,
    },
    /// The store was closed.
    #[error("change feed closed")]
    Closed,
}

/// Publishes change events to live subscribers.
///
/// Each subscriber gets its own bounded buffer; a subscriber that falls more
/// than `capacity` events behind observes [`FeedError::Lagged`] without
/// affecting anyone else.
#[derive(Debug)]
pub struct ChangeFeed {
    sender: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    /// Creates a feed with a per-subscriber buffer of `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Registers a live receiver. `None` once the feed is closed.
    pub(crate) fn receiver(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.sender.lock().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Publishes one event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: ChangeEvent) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    /// Number of live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Ends every subscription with [`FeedError::Closed`] once drained.
    pub(crate) fn close(&self) {
        self.sender.lock().take();
    }
}

/// A cancellable stream of change events.
///
/// Backlog events (for [`Since::Sequence`]) come first, then live events.
/// Dropping the subscription or calling [`Subscription::cancel`] releases
/// its buffer.
#[derive(Debug)]
pub struct Subscription {
    backlog: VecDeque<ChangeEvent>,
    receiver: Option<broadcast::Receiver<ChangeEvent>>,
    include_docs: bool,
    last_seq: u64,
}

impl Subscription {
    pub(crate) fn new(
        backlog: Vec<ChangeEvent>,
        receiver: Option<broadcast::Receiver<ChangeEvent>>,
        include_docs: bool,
        start_seq: u64,
    ) -> Self {
        Self {
            backlog: backlog.into(),
            receiver,
            include_docs,
            last_seq: start_seq,
        }
    }

    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` when the subscription is finished: cancelled, or
    /// not live and the backlog is drained.
    ///
    /// # Errors
    ///
    /// [`FeedError::Lagged`] when live events were dropped (the subscription
    /// stays usable and resumes with the oldest retained event), and
    /// [`FeedError::Closed`] when the store closed.
    pub async fn recv(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(self.deliver(event)));
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };
        match receiver.recv().await {
            Ok(event) => Ok(Some(self.deliver(event))),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(FeedError::Lagged { skipped }),
            Err(broadcast::error::RecvError::Closed) => {
                self.receiver = None;
                Err(FeedError::Closed)
            }
        }
    }

    /// Returns the next event if one is ready, without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(self.deliver(event)));
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };
        match receiver.try_recv() {
            Ok(event) => Ok(Some(self.deliver(event))),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                Err(FeedError::Lagged { skipped })
            }
            Err(broadcast::error::TryRecvError::Closed) => {
                self.receiver = None;
                Err(FeedError::Closed)
            }
        }
    }

    /// Stops delivery. Every later `recv` returns `Ok(None)`.
    pub fn cancel(&mut self) {
        self.backlog.clear();
        self.receiver = None;
    }

    /// True until cancelled, closed, or drained in non-live mode.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.receiver.is_some() || !self.backlog.is_empty()
    }

    /// Sequence of the last delivered event (or the start point).
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn deliver(&mut self, mut event: ChangeEvent) -> ChangeEvent {
        self.last_seq = event.seq;
        if !self.include_docs {
            event.document = None;
        }
        event
    }
}
