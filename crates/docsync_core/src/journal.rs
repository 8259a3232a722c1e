//! The document journal.
//!
//! Every committed mutation is appended to the journal before it becomes
//! visible. Opening a store replays the journal from the start.
//!
//! ## Frame Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of a [`JournalRecord`]. The CRC covers
//! header and payload.
//!
//! ## Recovery Policy
//!
//! A frame that runs past the end of the journal, or the final frame failing
//! its checksum, is a write torn by a crash: replay stops there and the tail
//! is cut off. A checksum failure on any earlier frame, bad magic, an unknown
//! version or record type, or an undecodable payload are real damage and the
//! store refuses to open.

use crate::document::{Document, Revision};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use docsync_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Magic bytes opening every frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"DSJ1";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Document written.
    Put = 1,
    /// Document removed.
    Delete = 2,
    /// Local metadata written.
    Local = 3,
}

impl RecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            3 => Some(Self::Local),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A document was created or updated.
    Put {
        /// Store sequence assigned to the write.
        seq: u64,
        /// Full document as written, revision included.
        document: Document,
    },
    /// A document was removed, leaving a tombstone.
    Delete {
        /// Store sequence assigned to the removal.
        seq: u64,
        /// Document id.
        id: String,
        /// Kind of the removed document.
        kind: String,
        /// Tombstone revision.
        revision: Revision,
        /// Time of removal.
        deleted_at: DateTime<Utc>,
    },
    /// Non-replicated metadata, such as a replication checkpoint.
    Local {
        /// Record key.
        key: String,
        /// Record value.
        value: Value,
    },
}

impl JournalRecord {
    /// Frame type for this record.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Put { .. } => RecordType::Put,
            Self::Delete { .. } => RecordType::Delete,
            Self::Local { .. } => RecordType::Local,
        }
    }

    /// Store sequence, for records that carry one.
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Put { seq, .. } | Self::Delete { seq, .. } => Some(*seq),
            Self::Local { .. } => None,
        }
    }

    /// Encodes the record as a complete frame.
    pub fn encode_frame(&self) -> CoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload).map_err(|e| CoreError::codec(e.to_string()))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("journal record too large"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.push(self.record_type().as_byte());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Outcome of scanning raw journal bytes.
#[derive(Debug)]
pub struct Scan {
    /// Records of every intact frame, in order.
    pub records: Vec<JournalRecord>,
    /// Length of the intact prefix.
    pub valid_len: u64,
}

impl Scan {
    /// True when bytes after the intact prefix must be cut off.
    #[must_use]
    pub fn is_torn(&self, total_len: u64) -> bool {
        self.valid_len < total_len
    }
}

/// Parses every frame in `bytes`.
///
/// # Errors
///
/// Fails on damage that is not a torn tail; see the module docs.
pub fn scan(bytes: &[u8]) -> CoreResult<Scan> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        let rest = &bytes[pos..];
        if rest.len() < HEADER_SIZE {
            break;
        }

        if rest[0..4] != JOURNAL_MAGIC {
            return Err(CoreError::JournalCorruption {
                offset,
                message: "invalid magic".into(),
            });
        }

        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > JOURNAL_VERSION {
            return Err(CoreError::JournalCorruption {
                offset,
                message: format!("unsupported version {version}"),
            });
        }

        let type_byte = rest[6];
        let record_type =
            RecordType::from_byte(type_byte).ok_or_else(|| CoreError::JournalCorruption {
                offset,
                message: format!("unknown record type {type_byte}"),
            })?;

        let payload_len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if rest.len() < total_len {
            break;
        }

        let payload_end = HEADER_SIZE + payload_len;
        let stored = u32::from_le_bytes([
            rest[payload_end],
            rest[payload_end + 1],
            rest[payload_end + 2],
            rest[payload_end + 3],
        ]);
        let computed = crc32fast::hash(&rest[..payload_end]);
        if stored != computed {
            if rest.len() == total_len {
                // final frame: torn
                break;
            }
            return Err(CoreError::ChecksumMismatch {
                offset,
                expected: stored,
                actual: computed,
            });
        }

        let record: JournalRecord = ciborium::from_reader(&rest[HEADER_SIZE..payload_end])
            .map_err(|e| CoreError::JournalCorruption {
                offset,
                message: format!("undecodable payload: {e}"),
            })?;
        if record.record_type() != record_type {
            return Err(CoreError::JournalCorruption {
                offset,
                message: "record type does not match payload".into(),
            });
        }

        records.push(record);
        pos += total_len;
    }

    Ok(Scan {
        records,
        valid_len: pos as u64,
    })
}

/// Append-only writer over a storage backend.
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend,
            sync_on_write,
        }
    }

    /// Reads back every record, cutting off a torn tail.
    pub fn replay(&mut self) -> CoreResult<Vec<JournalRecord>> {
        let bytes = self.backend.read_all()?;
        let total = bytes.len() as u64;
        let scan = scan(&bytes)?;
        if scan.is_torn(total) {
            warn!(
                valid_len = scan.valid_len,
                dropped = total - scan.valid_len,
                "truncating torn journal tail"
            );
            self.backend.truncate(scan.valid_len)?;
            self.backend.sync()?;
        }
        Ok(scan.records)
    }

    /// Appends one record and returns its offset.
    pub fn append(&mut self, record: &JournalRecord) -> CoreResult<u64> {
        let frame = record.encode_frame()?;
        let offset = self.backend.append(&frame)?;
        if self.sync_on_write {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(offset)
    }

    /// Forces everything appended so far to durable storage.
    pub fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Current journal size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Swaps in a new backend, returning the old one.
    pub fn replace_backend(&mut self, backend: Box<dyn StorageBackend>) -> Box<dyn StorageBackend> {
        std::mem::replace(&mut self.backend, backend)
    }

    /// Replaces the journal contents in place with `records`.
    ///
    /// Only used for backends without a directory to rename within.
    pub fn rewrite_in_place(&mut self, records: &[JournalRecord]) -> CoreResult<()> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&record.encode_frame()?);
        }
        self.backend.truncate(0)?;
        self.backend.append(&data)?;
        self.backend.sync()?;
        Ok(())
    }
}

/// Writes `records` as frames into `backend` and syncs it.
pub fn write_all(backend: &mut dyn StorageBackend, records: &[JournalRecord]) -> CoreResult<()> {
    for record in records {
        backend.append(&record.encode_frame()?)?;
    }
    backend.sync()?;
    Ok(())
}
