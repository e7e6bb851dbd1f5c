use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{per_second, IndexStats, IndexSummary};
use crate::core::types::{IndexEntry, RecordAttributes, RecordId, RecordLocation, WorkItem};
use crate::index::extractor::{AttributeExtractor, NoAttributes};
use crate::index::scanner::scan_records;
use crate::mmap::mmap_file::MmapFile;
use crate::storage::file_lock::FileLock;
use crate::storage::index_file::{read_checksummed, write_checksummed};
use crate::storage::layout::lock_path_for;

pub const INDEX_MAGIC: &[u8; 8] = b"MBXIDX\0\0";
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// Bytes of each record hashed into `IndexEntry::quick_hash`
const QUICK_HASH_BYTES: usize = 512;

/// Identity of the archive an index was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub archive_path: PathBuf,
    pub archive_size: u64,
    pub archive_mtime: DateTime<Utc>,
    pub record_count: u64,
    pub index_schema_version: u32,
    pub delimiter: String,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFileBody {
    metadata: IndexMetadata,
    entries: Vec<IndexEntry>,
}

/// Scans an archive once and persists its offset index.
pub struct OffsetIndexBuilder {
    archive_path: PathBuf,
    index_path: PathBuf,
    delimiter: String,
    extractor: Arc<dyn AttributeExtractor>,
}

impl OffsetIndexBuilder {
    pub fn new(archive_path: impl Into<PathBuf>, index_path: impl Into<PathBuf>) -> Self {
        OffsetIndexBuilder {
            archive_path: archive_path.into(),
            index_path: index_path.into(),
            delimiter: "From ".to_string(),
            extractor: Arc::new(NoAttributes),
        }
    }

    pub fn from_config(config: &Config, extractor: Arc<dyn AttributeExtractor>) -> Self {
        OffsetIndexBuilder {
            archive_path: config.archive_path.clone(),
            index_path: config.index_path(),
            delimiter: config.delimiter.clone(),
            extractor,
        }
    }

    pub fn with_delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = delimiter.to_string();
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn AttributeExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// True when the index is missing, unreadable, corrupt, from another schema
    /// version, or describes a different archive size/mtime/path/delimiter.
    pub fn needs_rebuild(&self) -> bool {
        self.load_fresh().is_none()
    }

    /// The persisted index if it is still valid for the archive. Logs why not
    /// otherwise.
    pub fn load_fresh(&self) -> Option<OffsetIndex> {
        match self.check() {
            Ok(Freshness::Fresh(index)) => {
                debug!("Index {} is up to date", self.index_path.display());
                Some(index)
            }
            Ok(Freshness::Stale(reason)) => {
                info!("Index {} needs rebuild: {}", self.index_path.display(), reason);
                None
            }
            Err(e) => {
                warn!("Index {} needs rebuild: {}", self.index_path.display(), e);
                None
            }
        }
    }

    fn check(&self) -> Result<Freshness> {
        let index = match OffsetIndex::open(&self.index_path) {
            Ok(index) => index,
            Err(e) if e.kind == ErrorKind::NotFound => return Ok(Freshness::Stale("index does not exist".to_string())),
            Err(e) if e.kind == ErrorKind::IndexCorrupt => return Ok(Freshness::Stale(e.context)),
            Err(e) => return Err(e),
        };

        let metadata = &index.metadata;
        let (path, size, mtime) = archive_identity(&self.archive_path)?;
        let reason = if metadata.index_schema_version != INDEX_SCHEMA_VERSION {
            format!("schema version {}", metadata.index_schema_version)
        } else if metadata.archive_path != path {
            format!("built for {}", metadata.archive_path.display())
        } else if metadata.archive_size != size {
            format!("archive size changed ({} -> {})", metadata.archive_size, size)
        } else if metadata.archive_mtime != mtime {
            "archive modification time changed".to_string()
        } else if metadata.delimiter != self.delimiter {
            format!("delimiter changed ({:?} -> {:?})", metadata.delimiter, self.delimiter)
        } else {
            return Ok(Freshness::Fresh(index));
        };
        Ok(Freshness::Stale(reason))
    }

    /// One linear scan of the archive. The new index replaces the old one only
    /// once it is completely written.
    pub fn build(&self, show_progress: bool) -> Result<IndexStats> {
        if self.delimiter.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument, "empty record delimiter".to_string()));
        }
        let _lock = FileLock::acquire(&lock_path_for(&self.index_path))?;
        let start = Instant::now();

        let (path, size, mtime) = archive_identity(&self.archive_path)?;
        let archive = MmapFile::open_read_only(&self.archive_path)?;
        if archive.len != size {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("{} changed while opening it", self.archive_path.display()),
            ));
        }
        archive.advise_sequential();
        let data = archive.data();

        info!("Scanning {} ({} bytes) for record boundaries", path.display(), size);
        let scan = scan_records(data, self.delimiter.as_bytes());
        if scan.extents.is_empty() {
            warn!("No records found in {}", path.display());
        } else if scan.preamble_bytes > 0 {
            warn!("Ignoring {} bytes before the first record", scan.preamble_bytes);
        }

        let total = scan.extents.len();
        let report_every = (total / 10).max(1);
        let mut entries = Vec::with_capacity(total);
        for (i, &(byte_offset, byte_length)) in scan.extents.iter().enumerate() {
            let record = &data[byte_offset as usize..(byte_offset + byte_length) as usize];
            entries.push(IndexEntry {
                location: RecordLocation {
                    record_id: RecordId(i as u64),
                    byte_offset,
                    byte_length,
                },
                attributes: self.extractor.extract(record),
                quick_hash: quick_hash(record),
            });

            if show_progress && (i + 1) % report_every == 0 {
                info!("Indexing progress: {}% ({}/{})", (i + 1) * 100 / total, i + 1, total);
            }
        }

        let metadata = IndexMetadata {
            archive_path: path,
            archive_size: size,
            archive_mtime: mtime,
            record_count: total as u64,
            index_schema_version: INDEX_SCHEMA_VERSION,
            delimiter: self.delimiter.clone(),
            built_at: Utc::now(),
        };
        let body = IndexFileBody { metadata, entries };
        let (index_size_bytes, _) =
            write_checksummed(&self.index_path, INDEX_MAGIC, INDEX_SCHEMA_VERSION, &body)?;

        let build_duration = start.elapsed();
        let stats = IndexStats {
            record_count: total as u64,
            archive_bytes: size,
            preamble_bytes: scan.preamble_bytes,
            index_size_bytes,
            build_duration,
            throughput: per_second(total as u64, build_duration),
        };
        info!(
            "Index built: {} records in {:.1}s ({:.0} records/sec), {} bytes",
            stats.record_count,
            build_duration.as_secs_f64(),
            stats.throughput,
            stats.index_size_bytes
        );
        Ok(stats)
    }

    /// Load the persisted index, rebuilding it first if stale or forced.
    pub fn open_or_build(&self, force: bool, show_progress: bool) -> Result<OffsetIndex> {
        if !force {
            if let Some(index) = self.load_fresh() {
                return Ok(index);
            }
        }
        self.build(show_progress)?;
        OffsetIndex::open(&self.index_path)
    }
}

enum Freshness {
    Fresh(OffsetIndex),
    Stale(String),
}

/// Loaded offset index. Immutable; safe to share across workers.
#[derive(Debug)]
pub struct OffsetIndex {
    index_path: PathBuf,
    metadata: IndexMetadata,
    entries: Vec<IndexEntry>,
    by_group: BTreeMap<String, Vec<RecordId>>,
    by_secondary: BTreeMap<String, Vec<RecordId>>,
    by_timestamp: BTreeMap<i64, Vec<RecordId>>,
    body_crc: u32,
    file_len: u64,
}

impl OffsetIndex {
    /// Read and verify a persisted index. Anything that does not check out is
    /// `IndexCorrupt`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = read_checksummed::<IndexFileBody>(path, INDEX_MAGIC, INDEX_SCHEMA_VERSION)?;
        let IndexFileBody { metadata, entries } = file.body;
        validate_entries(&metadata, &entries)
            .map_err(|reason| Error::new(ErrorKind::IndexCorrupt, format!("{}: {}", path.display(), reason)))?;

        let mut by_group: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        let mut by_secondary: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        let mut by_timestamp: BTreeMap<i64, Vec<RecordId>> = BTreeMap::new();
        for entry in &entries {
            let id = entry.location.record_id;
            if let Some(key) = &entry.attributes.group_key {
                by_group.entry(key.clone()).or_default().push(id);
            }
            if let Some(key) = &entry.attributes.secondary_key {
                by_secondary.entry(key.clone()).or_default().push(id);
            }
            if let Some(ts) = entry.attributes.timestamp {
                by_timestamp.entry(ts).or_default().push(id);
            }
        }

        debug!("Loaded {} index entries from {}", entries.len(), path.display());
        Ok(OffsetIndex {
            index_path: path.to_path_buf(),
            metadata,
            entries,
            by_group,
            by_secondary,
            by_timestamp,
            body_crc: file.body_crc,
            file_len: file.file_len,
        })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn archive_path(&self) -> &Path {
        &self.metadata.archive_path
    }

    pub fn record_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checksum of the persisted body; identifies this exact index build.
    pub fn body_crc(&self) -> u32 {
        self.body_crc
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entry(&self, record_id: RecordId) -> Result<&IndexEntry> {
        self.entries.get(record_id.0 as usize).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("record {} not in index ({} records)", record_id, self.entries.len()),
            )
        })
    }

    /// O(1): record ids are dense, so the id is the position.
    pub fn location_of(&self, record_id: RecordId) -> Result<RecordLocation> {
        self.entry(record_id).map(|entry| entry.location)
    }

    pub fn attributes_of(&self, record_id: RecordId) -> Result<&RecordAttributes> {
        self.entry(record_id).map(|entry| &entry.attributes)
    }

    pub fn all_ids(&self) -> Vec<RecordId> {
        (0..self.record_count()).map(RecordId).collect()
    }

    /// Ids sharing `group_key`, ascending.
    pub fn ids_in_group(&self, group_key: &str) -> Vec<RecordId> {
        self.by_group.get(group_key).cloned().unwrap_or_default()
    }

    /// Ids sharing `secondary_key`, ascending.
    pub fn ids_in_secondary(&self, secondary_key: &str) -> Vec<RecordId> {
        self.by_secondary.get(secondary_key).cloned().unwrap_or_default()
    }

    /// Ids whose timestamp lies in `[timestamp_start, timestamp_end]`, ascending by id.
    pub fn ids_in_range(&self, timestamp_start: i64, timestamp_end: i64) -> Vec<RecordId> {
        if timestamp_start > timestamp_end {
            return Vec::new();
        }
        let mut ids: Vec<RecordId> = self
            .by_timestamp
            .range(timestamp_start..=timestamp_end)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Denormalize `ids` into self-contained work items.
    pub fn work_items(&self, ids: &[RecordId]) -> Result<Vec<WorkItem>> {
        ids.iter()
            .map(|&id| self.entry(id).map(WorkItem::from_entry))
            .collect()
    }

    pub fn statistics(&self) -> IndexSummary {
        let sizes = self.entries.iter().map(|entry| entry.location.byte_length);
        let total: u64 = sizes.clone().sum();
        let count = self.record_count();
        IndexSummary {
            record_count: count,
            total_record_bytes: total,
            avg_record_bytes: if count > 0 { total as f64 / count as f64 } else { 0.0 },
            max_record_bytes: sizes.clone().max().unwrap_or(0),
            min_record_bytes: sizes.min().unwrap_or(0),
            index_file_bytes: self.file_len,
        }
    }

    /// Groups of records with identical length and leading-bytes hash.
    pub fn duplicate_candidates(&self) -> Vec<Vec<RecordId>> {
        let mut buckets: HashMap<(u32, u64), Vec<RecordId>> = HashMap::new();
        for entry in &self.entries {
            buckets
                .entry((entry.quick_hash, entry.location.byte_length))
                .or_default()
                .push(entry.location.record_id);
        }
        let mut groups: Vec<Vec<RecordId>> = buckets.into_values().filter(|ids| ids.len() > 1).collect();
        groups.sort_by_key(|ids| ids[0]);
        groups
    }
}

fn validate_entries(metadata: &IndexMetadata, entries: &[IndexEntry]) -> std::result::Result<(), String> {
    if metadata.record_count != entries.len() as u64 {
        return Err(format!(
            "metadata says {} records, found {}",
            metadata.record_count,
            entries.len()
        ));
    }
    let mut previous_end = 0u64;
    for (i, entry) in entries.iter().enumerate() {
        let location = &entry.location;
        if location.record_id.0 != i as u64 {
            return Err(format!("record id {} at position {}", location.record_id, i));
        }
        if location.byte_offset < previous_end {
            return Err(format!("record {} overlaps its predecessor", i));
        }
        previous_end = location
            .byte_offset
            .checked_add(location.byte_length)
            .ok_or_else(|| format!("record {} extent overflows", i))?;
    }
    if previous_end > metadata.archive_size {
        return Err(format!(
            "records end at {} but archive was {} bytes",
            previous_end, metadata.archive_size
        ));
    }
    Ok(())
}

fn archive_identity(path: &Path) -> Result<(PathBuf, u64, DateTime<Utc>)> {
    let canonical = fs::canonicalize(path)?;
    let stat = fs::metadata(&canonical)?;
    let mtime: DateTime<Utc> = stat.modified()?.into();
    Ok((canonical, stat.len(), mtime))
}

fn quick_hash(record: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&record[..record.len().min(QUICK_HASH_BYTES)]);
    hasher.finalize()
}
