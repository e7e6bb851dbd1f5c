use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, warn};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{MetadataRow, RecordId};

/// Destination for metadata rows. Upserts replace any earlier row with the same
/// record id.
pub trait MetadataStore: Send {
    /// Insert or replace all rows in one operation. Returns rows written.
    fn upsert_batch(&mut self, rows: &[MetadataRow]) -> Result<usize>;

    fn get(&self, record_id: RecordId) -> Result<Option<MetadataRow>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop superseded data left by earlier upserts. Called once a run's final
    /// flush is done.
    fn compact(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Below this many lines on disk the file is never compacted mid-run.
const COMPACT_MIN_LINES: usize = 1024;

/// One JSON row per line. Upserts append only the new rows; on reload the
/// last row for an id wins. Superseded lines are dropped by rewriting the file
/// through a temp file and rename, on open and whenever they outnumber the
/// live rows.
pub struct JsonlMetadataStore {
    path: PathBuf,
    rows: BTreeMap<RecordId, MetadataRow>,
    /// Lines currently in the file, live or superseded
    lines: usize,
    bytes_written: u64,
}

impl JsonlMetadataStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut rows = BTreeMap::new();
        let mut lines = 0;
        let mut torn_tail = false;

        match File::open(&path) {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                let mut line = String::new();
                let mut line_no = 0;
                loop {
                    line.clear();
                    if reader.read_line(&mut line)? == 0 {
                        break;
                    }
                    line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<MetadataRow>(&line) {
                        Ok(row) => {
                            lines += 1;
                            rows.insert(row.record_id, row);
                        }
                        // An append cut short by a crash leaves an unterminated last line
                        Err(e) if !line.ends_with('\n') => {
                            warn!("Dropping torn last line {} of {}: {}", line_no, path.display(), e);
                            torn_tail = true;
                        }
                        Err(e) => {
                            return Err(Error::new(
                                ErrorKind::Parse,
                                format!("{} line {}: {}", path.display(), line_no, e),
                            ));
                        }
                    }
                }
                debug!("Loaded {} metadata rows ({} lines) from {}", rows.len(), lines, path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut store = JsonlMetadataStore {
            path,
            rows,
            lines,
            bytes_written: 0,
        };
        if torn_tail || store.lines > store.rows.len() {
            store.rewrite()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> impl Iterator<Item = &MetadataRow> {
        self.rows.values()
    }

    /// Bytes this handle has written, appends and compactions together.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn append(&self, rows: &[MetadataRow]) -> Result<u64> {
        fs::create_dir_all(self.parent_dir())?;
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let start = file.metadata()?.len();
        let written = file.write_all(&buf).and_then(|_| file.sync_data());
        if let Err(e) = written {
            // Cut back to the last complete row
            if let Err(trunc) = file.set_len(start) {
                warn!("Cannot truncate {} after failed append: {}", self.path.display(), trunc);
            }
            return Err(e.into());
        }
        Ok(buf.len() as u64)
    }

    fn needs_compaction(&self) -> bool {
        self.lines >= COMPACT_MIN_LINES && self.lines >= 2 * self.rows.len()
    }

    /// Rewrite the file with one line per live row, ordered by record id.
    fn rewrite(&mut self) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)?;

        let mut temp = NamedTempFile::new_in(&dir)?;
        let mut bytes = 0u64;
        {
            let mut out = BufWriter::new(temp.as_file_mut());
            for row in self.rows.values() {
                let line = serde_json::to_vec(row)?;
                out.write_all(&line)?;
                out.write_all(b"\n")?;
                bytes += line.len() as u64 + 1;
            }
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path)?;

        debug!("Compacted {} from {} to {} lines", self.path.display(), self.lines, self.rows.len());
        self.lines = self.rows.len();
        self.bytes_written += bytes;
        Ok(())
    }
}

impl MetadataStore for JsonlMetadataStore {
    fn upsert_batch(&mut self, rows: &[MetadataRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut previous = Vec::with_capacity(rows.len());
        for row in rows {
            previous.push((row.record_id, self.rows.insert(row.record_id, row.clone())));
        }

        match self.append(rows) {
            Ok(bytes) => {
                self.bytes_written += bytes;
                self.lines += rows.len();
            }
            Err(e) => {
                // Leave memory matching what is on disk
                for (id, old) in previous.into_iter().rev() {
                    match old {
                        Some(old) => self.rows.insert(id, old),
                        None => self.rows.remove(&id),
                    };
                }
                return Err(e);
            }
        }

        if self.needs_compaction() {
            if let Err(e) = self.rewrite() {
                warn!("Compaction of {} failed, keeping appended file: {}", self.path.display(), e);
            }
        }
        Ok(rows.len())
    }

    fn get(&self, record_id: RecordId) -> Result<Option<MetadataRow>> {
        Ok(self.rows.get(&record_id).cloned())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn compact(&mut self) -> Result<()> {
        if self.lines > self.rows.len() {
            self.rewrite()?;
        }
        Ok(())
    }
}

/// In-memory store. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataStore {
    rows: Arc<Mutex<BTreeMap<RecordId, MetadataRow>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<MetadataRow> {
        self.rows.lock().values().cloned().collect()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn upsert_batch(&mut self, rows: &[MetadataRow]) -> Result<usize> {
        let mut stored = self.rows.lock();
        for row in rows {
            stored.insert(row.record_id, row.clone());
        }
        Ok(rows.len())
    }

    fn get(&self, record_id: RecordId) -> Result<Option<MetadataRow>> {
        Ok(self.rows.lock().get(&record_id).cloned())
    }

    fn len(&self) -> usize {
        self.rows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FieldValue, MetadataFields};
    use tempfile::TempDir;

    fn row(id: u64, subject: &str) -> MetadataRow {
        let mut fields = MetadataFields::new();
        fields.insert("subject".to_string(), FieldValue::Text(subject.to_string()));
        MetadataRow {
            record_id: RecordId(id),
            group_key: None,
            artifact_path: PathBuf::from(format!("records/{:08}.eml", id)),
            fingerprint: "00ff".to_string(),
            fields,
        }
    }

    #[test]
    fn jsonl_upsert_replaces_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.jsonl");

        let mut store = JsonlMetadataStore::open(&path).unwrap();
        assert!(store.is_empty());
        store.upsert_batch(&[row(1, "first"), row(2, "two")]).unwrap();
        store.upsert_batch(&[row(1, "second")]).unwrap();
        assert_eq!(store.len(), 2);

        let reopened = JsonlMetadataStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(RecordId(1)).unwrap(), Some(row(1, "second")));

        let lines = fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    fn line_bytes(rows: &[MetadataRow]) -> u64 {
        rows.iter().map(|row| serde_json::to_vec(row).unwrap().len() as u64 + 1).sum()
    }

    #[test]
    fn upserts_append_only_the_new_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.jsonl");
        let mut store = JsonlMetadataStore::open(&path).unwrap();

        let mut expected = 0;
        for flush in 0..200u64 {
            let batch: Vec<MetadataRow> = (0..20).map(|i| row(flush * 20 + i, "s")).collect();
            expected += line_bytes(&batch);
            store.upsert_batch(&batch).unwrap();
            // Each flush costs its own rows, not the table so far
            assert_eq!(store.bytes_written(), expected);
        }
        assert_eq!(store.len(), 4000);
        assert_eq!(fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn repeated_ids_stay_linear_and_compact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.jsonl");
        let mut store = JsonlMetadataStore::open(&path).unwrap();

        let mut appended = 0;
        for round in 0..200 {
            let batch: Vec<MetadataRow> = (0..20).map(|i| row(i, &format!("round {:03}", round))).collect();
            appended += line_bytes(&batch);
            store.upsert_batch(&batch).unwrap();
        }
        // Mid-run compactions at most double the appended bytes
        assert!(store.bytes_written() <= 2 * appended);
        assert!(fs::read_to_string(&path).unwrap().lines().count() < COMPACT_MIN_LINES * 2);

        store.compact().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 20);
        let reopened = JsonlMetadataStore::open(&path).unwrap();
        assert_eq!(reopened.get(RecordId(5)).unwrap(), Some(row(5, "round 199")));
    }

    #[test]
    fn reload_keeps_last_row_and_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.jsonl");
        let mut text = String::new();
        for r in [row(1, "old"), row(2, "two"), row(1, "new")] {
            text.push_str(&serde_json::to_string(&r).unwrap());
            text.push('\n');
        }
        text.push_str("{\"record_id\":3,\"gro");
        fs::write(&path, text).unwrap();

        let store = JsonlMetadataStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(RecordId(1)).unwrap(), Some(row(1, "new")));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);

        fs::write(&path, "{\"broken\"\n").unwrap();
        let err = JsonlMetadataStore::open(&path).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[test]
    fn memory_store_clones_share_rows() {
        let store = MemoryMetadataStore::new();
        let mut handle = store.clone();
        handle.upsert_batch(&[row(3, "x")]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].record_id, RecordId(3));
    }
}
