use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use chrono::{DateTime, Utc};

/// Dense, 0-based record identifier assigned in archive scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn new(id: u64) -> Self {
        RecordId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        RecordId(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte extent of one record inside the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLocation {
    pub record_id: RecordId,
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl RecordLocation {
    pub fn end(&self) -> u64 {
        self.byte_offset + self.byte_length
    }
}

/// Scalar attributes captured at index-build time. Absence is `None`, never "".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordAttributes {
    pub group_key: Option<String>,
    pub secondary_key: Option<String>,
    pub timestamp: Option<i64>,
    pub message_id: Option<String>,
}

/// One row of the offset index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub location: RecordLocation,
    pub attributes: RecordAttributes,
    /// crc32 over the first bytes of the record, for duplicate detection.
    pub quick_hash: u32,
}

/// Self-contained unit of work; needs no further index lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub record_id: RecordId,
    pub byte_offset: u64,
    pub byte_length: u64,
    pub group_key: Option<String>,
    pub secondary_key: Option<String>,
}

impl WorkItem {
    pub fn from_entry(entry: &IndexEntry) -> Self {
        WorkItem {
            record_id: entry.location.record_id,
            byte_offset: entry.location.byte_offset,
            byte_length: entry.location.byte_length,
            group_key: entry.attributes.group_key.clone(),
            secondary_key: entry.attributes.secondary_key.clone(),
        }
    }
}

/// Work assigned to exactly one worker for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkBatch {
    pub index: usize,
    pub items: Vec<WorkItem>,
}

impl WorkBatch {
    pub fn new(index: usize, items: Vec<WorkItem>) -> Self {
        WorkBatch { index, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.items.iter().map(|item| item.record_id).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|item| item.byte_length).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Date(DateTime<Utc>),
    Boolean(bool),
}

pub type MetadataFields = BTreeMap<String, FieldValue>;

/// What an external per-record transform hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub rendered_artifact: Vec<u8>,
    pub metadata: MetadataFields,
    pub fingerprint: Vec<u8>,
}

/// Transform output tagged with the record it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    pub record_id: RecordId,
    pub group_key: Option<String>,
    pub rendered_artifact: Vec<u8>,
    pub metadata_row: MetadataFields,
    pub content_fingerprint: Vec<u8>,
}

impl TransformResult {
    pub fn new(item: &WorkItem, output: TransformOutput) -> Self {
        TransformResult {
            record_id: item.record_id,
            group_key: item.group_key.clone(),
            rendered_artifact: output.rendered_artifact,
            metadata_row: output.metadata,
            content_fingerprint: output.fingerprint,
        }
    }

    /// Approximate buffered footprint.
    pub fn size_bytes(&self) -> usize {
        self.rendered_artifact.len() + self.content_fingerprint.len() + self.metadata_row.len() * 32
    }
}

/// Row persisted to the metadata store, keyed by record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub record_id: RecordId,
    pub group_key: Option<String>,
    pub artifact_path: PathBuf,
    pub fingerprint: String,
    pub fields: MetadataFields,
}

pub fn hex_fingerprint(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
