//! Inspect command implementation.

use super::open_existing;
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Store identifier.
    pub store_id: String,
    /// Sequence of the latest mutation.
    pub update_seq: u64,
    /// Live documents.
    pub doc_count: usize,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Live documents per kind.
    pub kinds: Vec<KindStats>,
}

/// Document count for one kind.
#[derive(Debug, Serialize)]
pub struct KindStats {
    /// Kind name.
    pub kind: String,
    /// Live documents of this kind.
    pub count: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let journal_size = std::fs::metadata(path.join("documents.log")).map_or(0, |m| m.len());

    let result = InspectResult {
        path: path.display().to_string(),
        store_id: store.store_id().to_string(),
        update_seq: store.update_seq(),
        doc_count: store.doc_count(),
        journal_size,
        kinds: store
            .kind_counts()
            .into_iter()
            .map(|(kind, count)| KindStats { kind, count })
            .collect(),
    };
    store.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Store: {}", result.path);
    println!("  Id:           {}", result.store_id);
    println!("  Update seq:   {}", result.update_seq);
    println!("  Documents:    {}", result.doc_count);
    println!("  Journal size: {} bytes", result.journal_size);

    if !result.kinds.is_empty() {
        println!();
        println!("Kinds:");
        for stats in &result.kinds {
            println!("  {:<24} {}", stats.kind, stats.count);
        }
    }
}
