//! Ordering index over live documents.
//!
//! Keeps every live document id ordered by `(updated_at, id)`, once per kind
//! and once across all non-reserved kinds. `find` walks these sets instead of
//! scanning and sorting the whole store; the results are the same.

use crate::document::{is_reserved_kind, SortOrder};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

type IndexKey = (DateTime<Utc>, String);

/// Per-kind ordering index.
#[derive(Debug, Default)]
pub struct KindIndex {
    by_kind: HashMap<String, BTreeSet<IndexKey>>,
    domain: BTreeSet<IndexKey>,
}

impl KindIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a live document.
    pub fn insert(&mut self, kind: &str, updated_at: DateTime<Utc>, id: &str) {
        let key = (updated_at, id.to_string());
        if !is_reserved_kind(kind) {
            self.domain.insert(key.clone());
        }
        self.by_kind.entry(kind.to_string()).or_default().insert(key);
    }

    /// Removes a document previously inserted with the same values.
    pub fn remove(&mut self, kind: &str, updated_at: DateTime<Utc>, id: &str) {
        let key = (updated_at, id.to_string());
        self.domain.remove(&key);
        if let Some(set) = self.by_kind.get_mut(kind) {
            set.remove(&key);
            if set.is_empty() {
                self.by_kind.remove(kind);
            }
        }
    }

    /// Ids in the requested order. `kind: None` covers non-reserved kinds.
    #[must_use]
    pub fn ids(&self, kind: Option<&str>, order: SortOrder, limit: Option<usize>) -> Vec<String> {
        let set = match kind {
            Some(kind) => match self.by_kind.get(kind) {
                Some(set) => set,
                None => return Vec::new(),
            },
            None => &self.domain,
        };
        let limit = limit.unwrap_or(usize::MAX);
        match order {
            SortOrder::UpdatedDesc => {
                set.iter().rev().take(limit).map(|(_, id)| id.clone()).collect()
            }
            SortOrder::UpdatedAsc => set.iter().take(limit).map(|(_, id)| id.clone()).collect(),
        }
    }

    /// Live documents per kind, reserved kinds included.
    #[must_use]
    pub fn counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<_> = self
            .by_kind
            .iter()
            .map(|(kind, set)| (kind.clone(), set.len()))
            .collect();
        counts.sort();
        counts
    }
}
