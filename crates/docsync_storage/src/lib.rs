//! # docsync storage
//!
//! Append-only byte stores that hold the document journal.
//!
//! Backends never interpret what they store. The journal framing, record
//! types and replay rules all live in `docsync_core`; a backend only has to
//! append, read back, flush and truncate.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests
//! - [`FileBackend`] - the `documents.log` file of an on-disk store
//!
//! ## Example
//!
//! ```rust
//! use docsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"frame").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
