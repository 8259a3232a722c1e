//! Single-document commands: list, get, put, remove.

use super::open_existing;
use docsync_core::{Document, DocumentStore, Query, Revision};
use serde::Serialize;
use std::path::Path;

/// One row of `list` output.
#[derive(Debug, Serialize)]
pub struct DocumentRow {
    /// Document id.
    pub id: String,
    /// Current revision.
    pub rev: String,
    /// Document kind.
    pub kind: String,
    /// Last update, RFC 3339.
    pub updated_at: String,
}

impl From<&Document> for DocumentRow {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            rev: doc.revision.as_ref().map(|r| r.as_str().to_string()).unwrap_or_default(),
            kind: doc.kind.clone(),
            updated_at: doc.updated_at.to_rfc3339(),
        }
    }
}

/// Runs the list command.
pub fn list(
    path: &Path,
    kind: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let query = Query {
        kind: kind.map(str::to_string),
        limit,
        ..Query::default()
    };
    let rows: Vec<DocumentRow> = store.find(&query)?.iter().map(DocumentRow::from).collect();
    store.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            for row in &rows {
                println!("{:<38} {:<22} {:<16} {}", row.id, row.rev, row.kind, row.updated_at);
            }
            println!("{} document(s)", rows.len());
        }
    }
    Ok(())
}

/// Runs the get command.
pub fn get(path: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let doc = store.get(id)?;
    store.close()?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

/// Runs the put command. Creates the store if needed.
pub fn put(
    path: &Path,
    id: Option<String>,
    kind: &str,
    content: &str,
    rev: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let content: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("content is not valid JSON: {e}"))?;
    let mut doc = match id {
        Some(id) => Document::new(id, kind, content),
        None => Document::with_generated_id(kind, content),
    };
    if let Some(rev) = rev {
        doc = doc.at_revision(Revision::from(rev));
    }

    let store = DocumentStore::open(path)?;
    let id = doc.id.clone();
    let revision = store.put(doc)?;
    store.close()?;

    println!("{id} {}", revision.as_str());
    Ok(())
}

/// Runs the remove command.
pub fn remove(path: &Path, id: &str, rev: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let tombstone = store.remove(id, &Revision::from(rev))?;
    store.close()?;
    println!("{id} {}", tombstone.as_str());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_remove_round_trips_through_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store");

        put(&path, Some("n1".into()), "note", r#"{"title":"hi"}"#, None).unwrap();
        let rev = {
            let store = open_existing(&path).unwrap();
            let doc = store.get("n1").unwrap();
            assert_eq!(doc.content["title"], "hi");
            store.close().unwrap();
            doc.revision.unwrap()
        };

        assert!(remove(&path, "n1", "1-0000000000000000").is_err());
        remove(&path, "n1", rev.as_str()).unwrap();

        let store = open_existing(&path).unwrap();
        assert!(store.get("n1").unwrap_err().is_not_found());
    }

    #[test]
    fn invalid_content_is_rejected_before_opening() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("never");

        assert!(put(&path, None, "note", "{not json", None).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn reading_a_missing_store_fails() {
        let temp = tempfile::tempdir().unwrap();
        assert!(get(&temp.path().join("missing"), "x").is_err());
    }
}
