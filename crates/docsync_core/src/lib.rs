//! # docsync core
//!
//! Revisioned document store for docsync.
//!
//! This crate provides:
//! - [`Document`] and [`Revision`], the unit of synchronization and its
//!   optimistic-concurrency token
//! - [`DocumentStore`], a durable store with conflict-checked writes,
//!   bounded-retry convenience writers and kind queries
//! - [`ChangeFeed`] / [`Subscription`], live cancellable change streams
//! - the journal that persists every mutation
//!
//! ## Example
//!
//! ```rust
//! use docsync_core::{Document, DocumentStore, Query};
//! use serde_json::json;
//!
//! let store = DocumentStore::open_in_memory().unwrap();
//! let rev = store.put(Document::new("n1", "note", json!("A"))).unwrap();
//! store
//!     .put(Document::new("n1", "note", json!("B")).at_revision(rev))
//!     .unwrap();
//!
//! let notes = store.find(&Query::kind("note")).unwrap();
//! assert_eq!(notes[0].content, json!("B"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod dir;
mod document;
mod error;
mod index;
pub mod journal;
mod store;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeOptions, FeedError, Since, Subscription};
pub use config::StoreConfig;
pub use document::{is_reserved_kind, Document, Query, Revision, SortOrder, RESERVED_KIND_PREFIX};
pub use error::{CoreError, CoreResult};
pub use store::{CompactStats, DocumentStore, MAX_WRITE_ATTEMPTS};
