//! Documents, revisions and queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Prefix marking kinds that hold non-domain records.
///
/// Reserved kinds are stored like any other document but never replicated.
pub const RESERVED_KIND_PREFIX: char = '_';

/// Opaque version token issued by the store on every successful write.
///
/// The textual form is `<generation>-<16 hex digits>`. The generation counts
/// writes along a document's lineage; the suffix makes two revisions of the
/// same generation distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// The revision issued to a brand-new document.
    #[must_use]
    pub fn first() -> Self {
        Self::with_generation(1)
    }

    fn with_generation(generation: u64) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{generation}-{}", &suffix[..16]))
    }

    /// The revision that follows this one.
    #[must_use]
    pub fn next(&self) -> Self {
        Self::with_generation(self.generation().saturating_add(1))
    }

    /// Write count along the lineage, or 0 for a foreign token.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0)
    }

    /// Raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Revision {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for Revision {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// The unit of synchronization.
///
/// `content` belongs to the caller; the store never looks inside it.
/// `revision`, `created_at` and `updated_at` are maintained by the store:
/// whatever a caller sets for `updated_at` is overwritten on write, and
/// `created_at` is only honoured the first time an id is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Stable key, immutable after creation.
    #[serde(rename = "_id")]
    pub id: String,
    /// Current revision; `None` for a document never written.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    /// Discriminator used by queries.
    pub kind: String,
    /// Caller-owned payload.
    #[serde(default)]
    pub content: Value,
    /// Time of first write.
    pub created_at: DateTime<Utc>,
    /// Time of latest write.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Creates an unsaved document.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, content: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            revision: None,
            kind: kind.into(),
            content,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates an unsaved document with a random UUID id.
    pub fn with_generated_id(kind: impl Into<String>, content: Value) -> Self {
        Self::new(Uuid::new_v4().to_string(), kind, content)
    }

    /// Sets the revision the next write will present.
    #[must_use]
    pub fn at_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    /// True when the kind is reserved for non-domain records.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        is_reserved_kind(&self.kind)
    }

    /// True when both documents carry the same kind and content.
    #[must_use]
    pub fn same_body(&self, other: &Document) -> bool {
        self.kind == other.kind && self.content == other.content
    }
}

/// True when `kind` is reserved for non-domain records.
#[must_use]
pub fn is_reserved_kind(kind: &str) -> bool {
    kind.starts_with(RESERVED_KIND_PREFIX)
}

/// Result ordering for [`Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Most recently updated first.
    #[default]
    UpdatedDesc,
    /// Least recently updated first.
    UpdatedAsc,
}

/// A `find` request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    /// Only documents of this kind; `None` means every non-reserved kind.
    pub kind: Option<String>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Result ordering.
    pub order: SortOrder,
}

impl Query {
    /// Documents of one kind, newest first.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Every non-reserved document, newest first.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Caps the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revision_lineage() {
        let first = Revision::first();
        assert_eq!(first.generation(), 1);

        let second = first.next();
        assert_eq!(second.generation(), 2);
        assert_ne!(first, second);

        // two successors of the same revision still differ
        assert_ne!(first.next(), first.next());
    }

    #[test]
    fn foreign_revision_has_generation_zero() {
        assert_eq!(Revision::from("opaque").generation(), 0);
        assert_eq!(Revision::from("opaque").next().generation(), 1);
    }

    #[test]
    fn document_json_shape() {
        let doc = Document::new("n1", "note", json!({"title": "A"})).at_revision("1-abc".into());
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["_id"], "n1");
        assert_eq!(value["_rev"], "1-abc");
        assert_eq!(value["kind"], "note");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_some());

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn unsaved_document_omits_rev() {
        let doc = Document::new("n1", "note", json!("A"));
        let value = serde_json::to_value(&doc).unwrap();
        assert!(value.get("_rev").is_none());
    }

    #[test]
    fn reserved_kinds() {
        assert!(is_reserved_kind("_design"));
        assert!(!is_reserved_kind("note"));
        assert!(Document::new("cfg", "_config", Value::Null).is_reserved());
    }

    #[test]
    fn query_builder() {
        let q = Query::kind("note").limit(3).order(SortOrder::UpdatedAsc);
        assert_eq!(q.kind.as_deref(), Some("note"));
        assert_eq!(q.limit, Some(3));
        assert_eq!(q.order, SortOrder::UpdatedAsc);
        assert_eq!(Query::all().kind, None);
    }
}
