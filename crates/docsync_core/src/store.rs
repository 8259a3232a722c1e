//! The document store facade.
//!
//! `DocumentStore` holds the latest state of every document in memory, backed
//! by the journal on disk. Writes use optimistic concurrency: a put or remove
//! must present the document's current revision, and anything else is
//! rejected with [`CoreError::Conflict`].

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeOptions, Since, Subscription};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::document::{Document, Query, Revision};
use crate::error::{CoreError, CoreResult};
use crate::index::KindIndex;
use crate::journal::{self, Journal, JournalRecord};
use chrono::{DateTime, Duration, Utc};
use docsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Attempts made by the convenience writers (`update`, `save_document`,
/// `delete_document`) before a conflict is surfaced: the first write plus
/// one automatic retry.
pub const MAX_WRITE_ATTEMPTS: usize = 2;

const STORE_ID_KEY: &str = "store_id";

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    document: Document,
    deleted: bool,
}

impl Entry {
    fn event(&self) -> ChangeEvent {
        ChangeEvent {
            seq: self.seq,
            id: self.document.id.clone(),
            revision: self.current_revision(),
            kind: self.document.kind.clone(),
            deleted: self.deleted,
            document: (!self.deleted).then(|| self.document.clone()),
        }
    }

    fn current_revision(&self) -> Revision {
        // every stored entry has been written at least once
        self.document
            .revision
            .clone()
            .unwrap_or_else(Revision::first)
    }

    fn record(&self) -> JournalRecord {
        if self.deleted {
            JournalRecord::Delete {
                seq: self.seq,
                id: self.document.id.clone(),
                kind: self.document.kind.clone(),
                revision: self.current_revision(),
                deleted_at: self.document.updated_at,
            }
        } else {
            JournalRecord::Put {
                seq: self.seq,
                document: self.document.clone(),
            }
        }
    }
}

#[derive(Debug)]
struct StoreState {
    journal: Journal,
    entries: HashMap<String, Entry>,
    // seq of each document's latest mutation -> id
    by_seq: BTreeMap<u64, String>,
    locals: HashMap<String, Value>,
    index: KindIndex,
    seq: u64,
    clock: DateTime<Utc>,
    open: bool,
}

impl StoreState {
    fn empty(journal: Journal) -> Self {
        Self {
            journal,
            entries: HashMap::new(),
            by_seq: BTreeMap::new(),
            locals: HashMap::new(),
            index: KindIndex::new(),
            seq: 0,
            clock: DateTime::<Utc>::MIN_UTC,
            open: true,
        }
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    /// Next `updated_at`, strictly after every one issued before.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock + Duration::microseconds(1)
        };
        self.clock
    }

    /// Applies a replayed or freshly committed record.
    fn apply(&mut self, record: JournalRecord) {
        if let Some(seq) = record.seq() {
            self.seq = self.seq.max(seq);
        }
        match record {
            JournalRecord::Put { seq, document } => {
                self.clock = self.clock.max(document.updated_at);
                self.unindex(&document.id);
                self.index
                    .insert(&document.kind, document.updated_at, &document.id);
                self.reseq(&document.id, seq);
                self.entries.insert(
                    document.id.clone(),
                    Entry {
                        seq,
                        document,
                        deleted: false,
                    },
                );
            }
            JournalRecord::Delete {
                seq,
                id,
                kind,
                revision,
                deleted_at,
            } => {
                self.clock = self.clock.max(deleted_at);
                self.unindex(&id);
                let created_at = self
                    .entries
                    .get(&id)
                    .map_or(deleted_at, |e| e.document.created_at);
                let document = Document {
                    id: id.clone(),
                    revision: Some(revision),
                    kind,
                    content: Value::Null,
                    created_at,
                    updated_at: deleted_at,
                };
                self.reseq(&id, seq);
                self.entries.insert(
                    id,
                    Entry {
                        seq,
                        document,
                        deleted: true,
                    },
                );
            }
            JournalRecord::Local { key, value } => {
                self.locals.insert(key, value);
            }
        }
    }

    /// Moves `id` to `seq` in the sequence index.
    fn reseq(&mut self, id: &str, seq: u64) {
        if let Some(entry) = self.entries.get(id) {
            self.by_seq.remove(&entry.seq);
        }
        self.by_seq.insert(seq, id.to_string());
    }

    fn unindex(&mut self, id: &str) {
        if let Some(entry) = self.entries.get(id) {
            if !entry.deleted {
                let doc = &entry.document;
                self.index.remove(&doc.kind, doc.updated_at, &doc.id);
            }
        }
    }

    fn live(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id).filter(|e| !e.deleted)
    }

    fn changes_since(&self, since: u64, limit: usize) -> Vec<ChangeEvent> {
        self.by_seq
            .range(since.saturating_add(1)..)
            .filter_map(|(_, id)| self.entries.get(id))
            .take(limit)
            .map(Entry::event)
            .collect()
    }

    fn snapshot_records(&self) -> Vec<JournalRecord> {
        let entries = self.by_seq.values().filter_map(|id| self.entries.get(id));
        let mut locals: Vec<(&String, &Value)> = self.locals.iter().collect();
        locals.sort_by(|a, b| a.0.cmp(b.0));

        entries
            .map(Entry::record)
            .chain(locals.into_iter().map(|(key, value)| JournalRecord::Local {
                key: key.clone(),
                value: value.clone(),
            }))
            .collect()
    }
}

/// Sizes before and after [`DocumentStore::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Journal size before compaction.
    pub bytes_before: u64,
    /// Journal size after compaction.
    pub bytes_after: u64,
    /// Records written to the new journal.
    pub records: usize,
}

/// A revisioned document store.
///
/// # Thread Safety
///
/// `DocumentStore` is `Send + Sync`. Reads run concurrently; writes are
/// serialized, and change events are published before the write lock is
/// released.
///
/// # Example
///
/// ```rust,ignore
/// use docsync_core::{Document, DocumentStore};
/// use serde_json::json;
///
/// let store = DocumentStore::open_in_memory()?;
/// let rev = store.put(Document::new("n1", "note", json!("A")))?;
/// let doc = store.get("n1")?;
/// assert_eq!(doc.revision, Some(rev));
/// ```
pub struct DocumentStore {
    config: StoreConfig,
    dir: Mutex<Option<StoreDir>>,
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
    feed: ChangeFeed,
    store_id: String,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("store_id", &self.store_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DocumentStore {
    /// Opens or creates a store at `path` with default configuration.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DatabaseLocked`] if another process has the store open
    /// - [`CoreError::ChecksumMismatch`] / [`CoreError::JournalCorruption`]
    ///   if the journal is damaged beyond a torn tail
    pub fn open_with_config(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        let mut store = Self::open_with_backend(config, Box::new(backend))?;
        store.path = Some(dir.path().to_path_buf());
        *store.dir.get_mut() = Some(dir);
        info!(path = %path.display(), store_id = %store.store_id, "opened document store");
        Ok(store)
    }

    /// Opens a store over an arbitrary journal backend.
    pub fn open_with_backend(
        config: StoreConfig,
        backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let mut journal = Journal::new(backend, config.sync_on_commit);
        let records = journal.replay()?;
        let replayed = records.len();

        let mut state = StoreState::empty(journal);
        for record in records {
            state.apply(record);
        }

        let store_id = match state.locals.get(STORE_ID_KEY).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                let record = JournalRecord::Local {
                    key: STORE_ID_KEY.to_string(),
                    value: Value::String(id.clone()),
                };
                state.journal.append(&record)?;
                state.apply(record);
                id
            }
        };
        debug!(replayed, seq = state.seq, "journal replayed");

        Ok(Self {
            feed: ChangeFeed::new(config.feed_capacity),
            config,
            dir: Mutex::new(None),
            path: None,
            state: RwLock::new(state),
            store_id,
        })
    }

    /// Opens an empty store that lives only in memory.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backend(StoreConfig::default(), Box::new(InMemoryBackend::new()))
    }

    /// Deletes the store at `path` and everything in it.
    ///
    /// # Errors
    ///
    /// [`CoreError::DatabaseLocked`] while the store is open anywhere.
    pub fn destroy(path: &Path) -> CoreResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let dir = StoreDir::open(path, false)?;
        drop(dir);
        fs::remove_dir_all(path)?;
        info!(path = %path.display(), "destroyed document store");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetches the live document with `id`.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the id was never written or was removed.
    pub fn get(&self, id: &str) -> CoreResult<Document> {
        let state = self.state.read();
        state.ensure_open()?;
        state
            .live(id)
            .map(|e| e.document.clone())
            .ok_or_else(|| CoreError::not_found(id))
    }

    /// Current revision of `id`, including the revision of a tombstone.
    ///
    /// The flag is true when the revision belongs to a tombstone.
    pub fn current_revision(&self, id: &str) -> CoreResult<Option<(Revision, bool)>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state
            .entries
            .get(id)
            .map(|e| (e.current_revision(), e.deleted)))
    }

    /// Documents matching `query`.
    ///
    /// Without a kind, every non-reserved kind is searched.
    pub fn find(&self, query: &Query) -> CoreResult<Vec<Document>> {
        let state = self.state.read();
        state.ensure_open()?;
        let ids = state
            .index
            .ids(query.kind.as_deref(), query.order, query.limit);
        Ok(ids
            .iter()
            .filter_map(|id| state.live(id).map(|e| e.document.clone()))
            .collect())
    }

    /// Latest state of every document whose last mutation is after `since`,
    /// ordered by that mutation's sequence. Tombstones are included.
    pub fn changes_since(&self, since: u64, limit: usize) -> CoreResult<Vec<ChangeEvent>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.changes_since(since, limit))
    }

    /// Sequence of the latest committed mutation.
    pub fn update_seq(&self) -> u64 {
        self.state.read().seq
    }

    /// Number of live documents, reserved kinds included.
    pub fn doc_count(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|e| !e.deleted)
            .count()
    }

    /// Live documents per kind.
    pub fn kind_counts(&self) -> Vec<(String, usize)> {
        self.state.read().index.counts()
    }

    /// Identifier of this store, stable across reopen.
    #[must_use]
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Directory of an on-disk store.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Reads a local (non-replicated) record.
    pub fn get_local(&self, key: &str) -> CoreResult<Option<Value>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.locals.get(key).cloned())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Writes `doc` and returns the revision issued for it.
    ///
    /// `doc.revision` must be the current revision of an existing id, or
    /// `None` for an id that has no live document.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDocument`] for an empty id or kind
    /// - [`CoreError::Conflict`] when the presented revision is stale
    pub fn put(&self, doc: Document) -> CoreResult<Revision> {
        validate(&doc)?;
        let mut state = self.state.write();
        state.ensure_open()?;

        let existing = state.entries.get(&doc.id);
        let (revision, created_at) = match existing {
            Some(entry) if !entry.deleted => {
                let current = entry.current_revision();
                if doc.revision.as_ref() != Some(&current) {
                    return Err(CoreError::conflict(doc.id, Some(current), doc.revision));
                }
                (current.next(), entry.document.created_at)
            }
            Some(entry) => {
                // recreating over a tombstone continues its lineage
                let tombstone = entry.current_revision();
                if doc.revision.is_some() && doc.revision.as_ref() != Some(&tombstone) {
                    return Err(CoreError::conflict(doc.id, None, doc.revision));
                }
                (tombstone.next(), doc.created_at)
            }
            None => {
                if doc.revision.is_some() {
                    return Err(CoreError::conflict(doc.id, None, doc.revision));
                }
                (Revision::first(), doc.created_at)
            }
        };

        let seq = state.seq + 1;
        let updated_at = state.tick();
        let document = Document {
            revision: Some(revision.clone()),
            created_at,
            updated_at,
            ..doc
        };
        let record = JournalRecord::Put { seq, document };
        self.commit(&mut state, record)?;
        Ok(revision)
    }

    /// Removes `id`, leaving a tombstone, and returns the tombstone revision.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] when no live document has this id
    /// - [`CoreError::Conflict`] when `revision` is stale
    pub fn remove(&self, id: &str, revision: &Revision) -> CoreResult<Revision> {
        let mut state = self.state.write();
        state.ensure_open()?;

        let entry = state.live(id).ok_or_else(|| CoreError::not_found(id))?;
        let current = entry.current_revision();
        if &current != revision {
            return Err(CoreError::conflict(
                id,
                Some(current),
                Some(revision.clone()),
            ));
        }
        let kind = entry.document.kind.clone();
        let tombstone = current.next();

        let seq = state.seq + 1;
        let deleted_at = state.tick();
        let record = JournalRecord::Delete {
            seq,
            id: id.to_string(),
            kind,
            revision: tombstone.clone(),
            deleted_at,
        };
        self.commit(&mut state, record)?;
        Ok(tombstone)
    }

    /// Writes a local (non-replicated) record. Produces no change event.
    pub fn set_local(&self, key: &str, value: Value) -> CoreResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let record = JournalRecord::Local {
            key: key.to_string(),
            value,
        };
        state.journal.append(&record)?;
        state.apply(record);
        Ok(())
    }

    fn commit(&self, state: &mut StoreState, record: JournalRecord) -> CoreResult<()> {
        state.journal.append(&record)?;
        let id = match &record {
            JournalRecord::Put { document, .. } => document.id.clone(),
            JournalRecord::Delete { id, .. } => id.clone(),
            JournalRecord::Local { key, .. } => key.clone(),
        };
        state.apply(record);
        if let Some(entry) = state.entries.get(&id) {
            debug!(
                id = %id,
                seq = entry.seq,
                rev = %entry.current_revision(),
                deleted = entry.deleted,
                "committed"
            );
            self.feed.emit(entry.event());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Convenience writers with bounded conflict retry
    // ------------------------------------------------------------------

    /// Creates a document of `kind` with a generated id.
    pub fn create(&self, kind: &str, content: Value) -> CoreResult<Document> {
        let doc = Document::with_generated_id(kind, content);
        let id = doc.id.clone();
        self.put(doc)?;
        self.get(&id)
    }

    /// Read-modify-write of `id`.
    ///
    /// `mutate` is applied to a fresh copy of the document. On a conflict
    /// the document is re-read and `mutate` applied again, up to
    /// [`MAX_WRITE_ATTEMPTS`] times in total.
    pub fn update<F>(&self, id: &str, mut mutate: F) -> CoreResult<Document>
    where
        F: FnMut(&mut Document),
    {
        let mut attempt = 1;
        loop {
            let mut doc = self.get(id)?;
            mutate(&mut doc);
            doc.id = id.to_string();
            match self.put(doc) {
                Ok(_) => return self.get(id),
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(id = %id, attempt, "update conflicted, retrying on fresh revision");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes `doc`'s kind and content, creating it if needed.
    ///
    /// The first attempt presents `doc.revision` as given. After a conflict
    /// the current revision is fetched and the same kind and content are
    /// written on top of it.
    pub fn save_document(&self, doc: Document) -> CoreResult<Document> {
        let id = doc.id.clone();
        let mut candidate = doc;
        let mut attempt = 1;
        loop {
            match self.put(candidate.clone()) {
                Ok(_) => return self.get(&id),
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(id = %id, attempt, "save conflicted, retrying on fresh revision");
                    candidate.revision = match self.current_revision(&id)? {
                        Some((rev, false)) => Some(rev),
                        _ => None,
                    };
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Removes `id` at whatever its current revision is.
    pub fn delete_document(&self, id: &str) -> CoreResult<Revision> {
        let mut attempt = 1;
        loop {
            let current = self.get(id)?.revision.unwrap_or_else(Revision::first);
            match self.remove(id, &current) {
                Ok(rev) => return Ok(rev),
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(id = %id, attempt, "delete conflicted, retrying on fresh revision");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Change feed
    // ------------------------------------------------------------------

    /// Subscribes to committed mutations.
    ///
    /// With [`Since::Sequence`], the latest state of every document changed
    /// after that sequence is delivered first; live events follow without a
    /// gap or duplicate.
    pub fn changes(&self, options: ChangeOptions) -> CoreResult<Subscription> {
        // the read lock keeps writers (and their events) out while the
        // backlog and the live receiver are taken together
        let state = self.state.read();
        state.ensure_open()?;

        let receiver = if options.live {
            Some(self.feed.receiver().ok_or(CoreError::DatabaseClosed)?)
        } else {
            None
        };
        let (backlog, start) = match options.since {
            Since::Now => (Vec::new(), state.seq),
            Since::Sequence(seq) => (state.changes_since(seq, usize::MAX), seq),
        };
        Ok(Subscription::new(
            backlog,
            receiver,
            options.include_docs,
            start,
        ))
    }

    /// The underlying feed.
    #[must_use]
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Rewrites the journal with only the latest state of each document,
    /// tombstone and local record.
    pub fn compact(&self) -> CoreResult<CompactStats> {
        let mut state = self.state.write();
        state.ensure_open()?;

        let bytes_before = state.journal.size()?;
        let records = state.snapshot_records();

        let dir = self.dir.lock();
        match dir.as_ref() {
            Some(dir) => {
                let compact_path = dir.compact_path();
                if compact_path.exists() {
                    fs::remove_file(&compact_path)?;
                }
                {
                    let mut backend = FileBackend::open(&compact_path)?;
                    journal::write_all(&mut backend, &records)?;
                }
                dir.install_compacted()?;
                let backend = FileBackend::open(&dir.journal_path())?;
                state.journal.replace_backend(Box::new(backend));
            }
            None => state.journal.rewrite_in_place(&records)?,
        }

        let bytes_after = state.journal.size()?;
        info!(bytes_before, bytes_after, records = records.len(), "compacted journal");
        Ok(CompactStats {
            bytes_before,
            bytes_after,
            records: records.len(),
        })
    }

    /// Flushes the journal, ends every subscription and releases the
    /// directory lock. Closing twice is a no-op.
    pub fn close(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        if !state.open {
            return Ok(());
        }
        state.journal.sync()?;
        state.open = false;
        self.feed.close();
        self.dir.lock().take();
        info!(store_id = %self.store_id, "closed document store");
        Ok(())
    }

    /// True until [`DocumentStore::close`].
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.read().open
    }
}

fn validate(doc: &Document) -> CoreResult<()> {
    if doc.id.is_empty() {
        return Err(CoreError::invalid_document("id must not be empty"));
    }
    if doc.kind.is_empty() {
        return Err(CoreError::invalid_document(format!(
            "document {} has an empty kind",
            doc.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SortOrder;
    use serde_json::json;
    use tempfile::tempdir;

    fn note(id: &str, content: Value) -> Document {
        Document::new(id, "note", content)
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = DocumentStore::open_in_memory().unwrap();
        let rev = store.put(note("n1", json!({"title": "A"}))).unwrap();

        let doc = store.get("n1").unwrap();
        assert_eq!(doc.content, json!({"title": "A"}));
        assert_eq!(doc.revision, Some(rev));
        assert_eq!(store.update_seq(), 1);
    }

    #[test]
    fn stale_revision_conflicts_after_update() {
        let store = DocumentStore::open_in_memory().unwrap();
        let r1 = store.put(note("n1", json!("A"))).unwrap();

        store
            .put(note("n1", json!("B")).at_revision(r1.clone()))
            .unwrap();
        let err = store
            .put(note("n1", json!("B")).at_revision(r1.clone()))
            .unwrap_err();
        assert!(err.is_conflict());

        let fresh = store.get("n1").unwrap();
        let r2 = store
            .put(note("n1", json!("C")).at_revision(fresh.revision.unwrap()))
            .unwrap();
        assert_ne!(r2, r1);
        assert_eq!(r2.generation(), 3);
    }

    #[test]
    fn new_id_with_revision_conflicts() {
        let store = DocumentStore::open_in_memory().unwrap();
        let err = store
            .put(note("n1", json!(1)).at_revision("1-abc".into()))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn existing_id_without_revision_conflicts() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.put(note("n1", json!(1))).unwrap();
        assert!(store.put(note("n1", json!(2))).unwrap_err().is_conflict());
    }

    #[test]
    fn double_remove_is_not_found() {
        let store = DocumentStore::open_in_memory().unwrap();
        let rev = store.put(note("n1", json!(1))).unwrap();

        let tombstone = store.remove("n1", &rev).unwrap();
        assert_eq!(tombstone.generation(), 2);
        assert!(store.get("n1").unwrap_err().is_not_found());
        assert!(store.remove("n1", &rev).unwrap_err().is_not_found());
    }

    #[test]
    fn remove_with_stale_revision_conflicts() {
        let store = DocumentStore::open_in_memory().unwrap();
        let r1 = store.put(note("n1", json!(1))).unwrap();
        store.put(note("n1", json!(2)).at_revision(r1.clone())).unwrap();
        assert!(store.remove("n1", &r1).unwrap_err().is_conflict());
    }

    #[test]
    fn recreate_continues_tombstone_lineage() {
        let store = DocumentStore::open_in_memory().unwrap();
        let r1 = store.put(note("n1", json!(1))).unwrap();
        store.remove("n1", &r1).unwrap();

        let r3 = store.put(note("n1", json!(2))).unwrap();
        assert_eq!(r3.generation(), 3);
        assert_eq!(store.doc_count(), 1);
    }

    #[test]
    fn created_at_is_kept_and_updated_at_rewritten() {
        let store = DocumentStore::open_in_memory().unwrap();
        let original = note("n1", json!(1));
        let created_at = original.created_at;
        let r1 = store.put(original).unwrap();
        let first = store.get("n1").unwrap();

        let mut next = note("n1", json!(2)).at_revision(r1);
        next.created_at = Utc::now() + Duration::days(1);
        store.put(next).unwrap();

        let second = store.get("n1").unwrap();
        assert_eq!(second.created_at, created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[test]
    fn find_orders_newest_first_and_skips_other_kinds() {
        let store = DocumentStore::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store.put(note(id, json!(id))).unwrap();
        }
        store
            .put(Document::new("cfg", "_config", json!({})))
            .unwrap();
        store.put(Document::new("t1", "task", json!(1))).unwrap();

        let ids: Vec<_> = store
            .find(&Query::kind("note"))
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, ["c", "b", "a"]);

        let all: Vec<_> = store
            .find(&Query::all().order(SortOrder::UpdatedAsc))
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(all, ["a", "b", "c", "t1"]);

        assert_eq!(store.find(&Query::kind("note").limit(1)).unwrap()[0].id, "c");
    }

    #[test]
    fn update_retries_once_on_conflict() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.put(note("n1", json!({"count": 0}))).unwrap();

        let mut calls = 0;
        let doc = store
            .update("n1", |doc| {
                calls += 1;
                if calls == 1 {
                    // a competing writer lands between read and write
                    let current = store.get("n1").unwrap();
                    let update = note("n1", json!({"count": 10}));
                    store
                        .put(update.at_revision(current.revision.unwrap()))
                        .unwrap();
                }
                let count = doc.content["count"].as_i64().unwrap();
                doc.content = json!({"count": count + 1});
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(doc.content, json!({"count": 11}));
    }

    #[test]
    fn update_surfaces_conflict_after_retry() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.put(note("n1", json!(0))).unwrap();

        let mut calls = 0;
        let err = store
            .update("n1", |doc| {
                calls += 1;
                let current = store.get("n1").unwrap();
                store
                    .put(note("n1", json!(-1)).at_revision(current.revision.unwrap()))
                    .unwrap();
                doc.content = json!(calls);
            })
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(calls, MAX_WRITE_ATTEMPTS);
    }

    #[test]
    fn save_document_reapplies_intent() {
        let store = DocumentStore::open_in_memory().unwrap();
        let r1 = store.put(note("n1", json!("A"))).unwrap();
        store.put(note("n1", json!("B")).at_revision(r1.clone())).unwrap();

        let saved = store
            .save_document(note("n1", json!("mine")).at_revision(r1))
            .unwrap();
        assert_eq!(saved.content, json!("mine"));
        assert_eq!(saved.revision.unwrap().generation(), 3);

        let created = store.save_document(note("n2", json!("new"))).unwrap();
        assert_eq!(created.revision.unwrap().generation(), 1);
    }

    #[test]
    fn delete_document_uses_current_revision() {
        let store = DocumentStore::open_in_memory().unwrap();
        let doc = store.create("note", json!("A")).unwrap();
        store.delete_document(&doc.id).unwrap();
        assert!(store.delete_document(&doc.id).unwrap_err().is_not_found());
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let store = DocumentStore::open_in_memory().unwrap();
        assert!(matches!(
            store.put(Document::new("", "note", Value::Null)),
            Err(CoreError::InvalidDocument { .. })
        ));
        assert!(matches!(
            store.put(Document::new("x", "", Value::Null)),
            Err(CoreError::InvalidDocument { .. })
        ));
    }

    #[test]
    fn changes_since_reports_latest_state() {
        let store = DocumentStore::open_in_memory().unwrap();
        let ra = store.put(note("a", json!(1))).unwrap();
        store.put(note("b", json!(1))).unwrap();
        store.remove("a", &ra).unwrap();

        let changes = store.changes_since(0, 10).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].id, "b");
        assert_eq!(changes[1].id, "a");
        assert!(changes[1].deleted);
        assert!(changes[1].document.is_none());
        assert_eq!(changes[1].seq, 3);

        assert_eq!(store.changes_since(2, 10).unwrap().len(), 1);
        assert_eq!(store.changes_since(0, 1).unwrap().len(), 1);
    }

    #[test]
    fn changes_since_pages_follow_latest_mutation() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let store = DocumentStore::open(&path).unwrap();
        for i in 0..20 {
            store.put(note(&format!("d{i}"), json!(i))).unwrap();
        }
        // rewriting the even ids moves them behind the odd ones
        for i in (0..20).step_by(2) {
            store
                .update(&format!("d{i}"), |d| d.content = json!("again"))
                .unwrap();
        }

        let mut since = 0;
        let mut ids = Vec::new();
        loop {
            let page = store.changes_since(since, 3).unwrap();
            let Some(last) = page.last() else {
                break;
            };
            since = last.seq;
            ids.extend(page.into_iter().map(|e| e.id));
        }
        let expected: Vec<String> = (1..20)
            .step_by(2)
            .chain((0..20).step_by(2))
            .map(|i| format!("d{i}"))
            .collect();
        assert_eq!(ids, expected);
        assert_eq!(since, store.update_seq());

        let before = store.changes_since(0, 100).unwrap();
        store.compact().unwrap();
        store.close().unwrap();
        let store = DocumentStore::open(&path).unwrap();
        assert_eq!(store.changes_since(0, 100).unwrap(), before);
    }

    #[test]
    fn local_records_are_invisible() {
        let store = DocumentStore::open_in_memory().unwrap();
        let mut sub = store.changes(ChangeOptions::live_from_now()).unwrap();

        store.set_local("replication/x", json!({"pull_seq": 4})).unwrap();
        assert_eq!(
            store.get_local("replication/x").unwrap(),
            Some(json!({"pull_seq": 4}))
        );
        assert_eq!(store.update_seq(), 0);
        assert_eq!(sub.try_recv().unwrap(), None);
        assert!(store.find(&Query::all()).unwrap().is_empty());
    }

    #[test]
    fn reopen_restores_state() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");

        let (store_id, rev) = {
            let store = DocumentStore::open(&path).unwrap();
            let rev = store.put(note("n1", json!("A"))).unwrap();
            let r2 = store.put(note("n2", json!("B"))).unwrap();
            store.remove("n2", &r2).unwrap();
            store.set_local("k", json!(1)).unwrap();
            store.close().unwrap();
            (store.store_id().to_string(), rev)
        };

        let store = DocumentStore::open(&path).unwrap();
        assert_eq!(store.store_id(), store_id);
        assert_eq!(store.get("n1").unwrap().revision, Some(rev));
        assert!(store.get("n2").unwrap_err().is_not_found());
        assert_eq!(store.update_seq(), 3);
        assert_eq!(store.get_local("k").unwrap(), Some(json!(1)));

        // the clock keeps moving forward after replay
        let before = store.get("n1").unwrap().updated_at;
        store.put(note("n3", json!("C"))).unwrap();
        assert!(store.get("n3").unwrap().updated_at > before);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let store = DocumentStore::open(&path).unwrap();

        store.close().unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.get("x"), Err(CoreError::DatabaseClosed)));
        assert!(matches!(
            store.put(note("x", json!(1))),
            Err(CoreError::DatabaseClosed)
        ));

        // the lock is released on close
        let reopened = DocumentStore::open(&path).unwrap();
        assert!(reopened.is_open());
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _store = DocumentStore::open(temp.path()).unwrap();
        assert!(matches!(
            DocumentStore::open(temp.path()),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn destroy_requires_closed_store() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let store = DocumentStore::open(&path).unwrap();
        store.put(note("n1", json!(1))).unwrap();

        assert!(matches!(
            DocumentStore::destroy(&path),
            Err(CoreError::DatabaseLocked)
        ));
        store.close().unwrap();
        DocumentStore::destroy(&path).unwrap();
        assert!(!path.exists());
        DocumentStore::destroy(&path).unwrap();
    }

    #[test]
    fn compact_keeps_latest_state() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        {
            let store = DocumentStore::open(&path).unwrap();
            let mut rev = store.put(note("n1", json!(0))).unwrap();
            for i in 1..20 {
                rev = store.put(note("n1", json!(i)).at_revision(rev)).unwrap();
            }
            let r2 = store.put(note("n2", json!("gone"))).unwrap();
            store.remove("n2", &r2).unwrap();

            let stats = store.compact().unwrap();
            assert!(stats.bytes_after < stats.bytes_before);
            assert_eq!(stats.records, 3);

            // writes after compaction land in the new journal
            store.put(note("n3", json!("after"))).unwrap();
            store.close().unwrap();
        }

        let store = DocumentStore::open(&path).unwrap();
        let doc = store.get("n1").unwrap();
        assert_eq!(doc.content, json!(19));
        assert_eq!(doc.revision.unwrap().generation(), 20);
        assert!(store.get("n2").unwrap_err().is_not_found());
        assert!(store.current_revision("n2").unwrap().unwrap().1);
        assert_eq!(store.get("n3").unwrap().content, json!("after"));
        assert_eq!(store.update_seq(), 23);
    }

    #[test]
    fn compact_in_memory() {
        let backend = InMemoryBackend::new();
        let store =
            DocumentStore::open_with_backend(StoreConfig::default(), Box::new(backend.clone()))
                .unwrap();
        let rev = store.put(note("n1", json!(1))).unwrap();
        store.put(note("n1", json!(2)).at_revision(rev)).unwrap();
        store.compact().unwrap();
        drop(store);

        let reopened =
            DocumentStore::open_with_backend(StoreConfig::default(), Box::new(backend)).unwrap();
        assert_eq!(reopened.get("n1").unwrap().content, json!(2));
    }
}
