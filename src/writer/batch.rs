use std::collections::HashMap;
use std::fs;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use log::{debug, error, warn};
use parking_lot::Mutex;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::WriterStats;
use crate::core::types::{hex_fingerprint, MetadataRow, RecordId, TransformResult};
use crate::parallel::processor::ResultSink;
use crate::writer::layout::ArtifactLayout;
use crate::writer::metadata_store::MetadataStore;

/// Buffer ceilings. Whichever is reached first triggers a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            max_items: 1000,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Pending results keyed by record id; a later result for the same id
/// replaces the earlier one.
#[derive(Debug, Default)]
struct OutputBuffer {
    entries: HashMap<RecordId, TransformResult>,
    bytes: usize,
}

impl OutputBuffer {
    fn insert(&mut self, result: TransformResult) {
        let size = result.size_bytes();
        if let Some(old) = self.entries.insert(result.record_id, result) {
            self.bytes -= old.size_bytes();
        }
        self.bytes += size;
    }

    fn is_full(&self, policy: &FlushPolicy) -> bool {
        self.entries.len() >= policy.max_items || self.bytes >= policy.max_bytes
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects results from every worker and writes them out in bulk: artifacts to
/// the filesystem, rows to the metadata store in one upsert per flush.
///
/// Workers only contend on the buffer lock, which covers the append and the
/// flush decision. Disk and store I/O run under a separate lock so flushes are
/// applied in the order their buffers were taken.
pub struct BatchWriter {
    layout: ArtifactLayout,
    policy: FlushPolicy,
    buffer: Mutex<OutputBuffer>,
    store: Mutex<Box<dyn MetadataStore>>,
    retry_attempts: usize,
    retry_backoff: Duration,
    flushes: AtomicU64,
    artifacts_written: AtomicU64,
    rows_written: AtomicU64,
}

impl BatchWriter {
    pub fn new(layout: ArtifactLayout, policy: FlushPolicy, store: Box<dyn MetadataStore>) -> Self {
        BatchWriter {
            layout,
            policy,
            buffer: Mutex::new(OutputBuffer::default()),
            store: Mutex::new(store),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            flushes: AtomicU64::new(0),
            artifacts_written: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config, store: Box<dyn MetadataStore>) -> Self {
        let layout = ArtifactLayout::new(&config.output_dir, config.artifact_layout, config.artifact_extension.clone());
        let policy = FlushPolicy {
            max_items: config.flush_max_items,
            max_bytes: config.flush_max_bytes,
        };
        BatchWriter::new(layout, policy, store).with_retry(config.sink_retry_attempts, config.sink_retry_backoff())
    }

    /// Total attempts per flush and the first backoff, which doubles each retry.
    pub fn with_retry(mut self, attempts: usize, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Buffer one result, flushing if a ceiling is reached.
    pub fn queue(&self, result: TransformResult) -> Result<()> {
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.insert(result);
            buffer.is_full(&self.policy)
        };
        if full {
            self.flush()?;
        }
        Ok(())
    }

    /// Write everything buffered. Returns the number of records written.
    pub fn flush(&self) -> Result<usize> {
        let mut store = self.store.lock();
        let pending = mem::take(&mut *self.buffer.lock());
        if pending.is_empty() {
            return Ok(0);
        }

        let mut backoff = self.retry_backoff;
        let mut attempt = 1;
        loop {
            match self.write_out(store.as_mut(), &pending) {
                Ok(count) => {
                    self.flushes.fetch_add(1, Ordering::Relaxed);
                    self.artifacts_written.fetch_add(count as u64, Ordering::Relaxed);
                    self.rows_written.fetch_add(count as u64, Ordering::Relaxed);
                    debug!("Flushed {} records ({} bytes)", count, pending.bytes);
                    return Ok(count);
                }
                Err(e) if attempt < self.retry_attempts => {
                    warn!(
                        "Flush of {} records failed (attempt {}/{}): {}; retrying in {:?}",
                        pending.len(),
                        attempt,
                        self.retry_attempts,
                        e,
                        backoff
                    );
                    thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Flush of {} records failed after {} attempts: {}", pending.len(), attempt, e);
                    self.restore(pending);
                    return Err(Error::new(
                        ErrorKind::SinkWriteFailure,
                        format!("flush failed after {} attempts: {}", attempt, e),
                    ));
                }
            }
        }
    }

    /// Final flush; nothing queued before this call is dropped. The store is
    /// then compacted; a failed compaction loses nothing and is only logged.
    pub fn finish(&self) -> Result<WriterStats> {
        self.flush()?;
        if let Err(e) = self.store.lock().compact() {
            warn!("Metadata store compaction failed: {}", e);
        }
        Ok(self.stats())
    }

    pub fn stats(&self) -> WriterStats {
        let buffer = self.buffer.lock();
        WriterStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            artifacts_written: self.artifacts_written.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            buffered_items: buffer.len(),
            buffered_bytes: buffer.bytes,
        }
    }

    fn write_out(&self, store: &mut dyn MetadataStore, pending: &OutputBuffer) -> Result<usize> {
        let mut results: Vec<&TransformResult> = pending.entries.values().collect();
        results.sort_by_key(|result| result.record_id);

        let mut rows = Vec::with_capacity(results.len());
        for result in results {
            let path = self.layout.artifact_path(result.record_id, result.group_key.as_deref());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &result.rendered_artifact)?;

            rows.push(MetadataRow {
                record_id: result.record_id,
                group_key: result.group_key.clone(),
                artifact_path: path,
                fingerprint: hex_fingerprint(&result.content_fingerprint),
                fields: result.metadata_row.clone(),
            });
        }

        store.upsert_batch(&rows)?;
        Ok(rows.len())
    }

    /// Put a failed flush back, unless newer results for the same ids arrived meanwhile.
    fn restore(&self, pending: OutputBuffer) {
        let mut buffer = self.buffer.lock();
        for (id, result) in pending.entries {
            if !buffer.entries.contains_key(&id) {
                buffer.insert(result);
            }
        }
    }
}

impl ResultSink for BatchWriter {
    fn queue(&self, result: TransformResult) -> Result<()> {
        BatchWriter::queue(self, result)
    }
}
