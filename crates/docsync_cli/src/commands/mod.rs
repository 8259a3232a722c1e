//! CLI command implementations.

pub mod compact;
pub mod documents;
pub mod inspect;
pub mod replicate;

use docsync_core::{DocumentStore, StoreConfig};
use std::path::Path;

/// Opens the store at `path`, refusing to create a new one.
pub fn open_existing(path: &Path) -> Result<DocumentStore, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    Ok(DocumentStore::open_with_config(path, StoreConfig::default().create_if_missing(false))?)
}
