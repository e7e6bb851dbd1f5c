use std::sync::Arc;
use std::time::Instant;
use log::{error, info, warn};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::{per_second, ProcessingStats, RunSummary};
use crate::core::types::RecordId;
use crate::index::extractor::AttributeExtractor;
use crate::index::group_index::{GroupIndex, GroupIndexBuilder};
use crate::index::offset_index::{OffsetIndex, OffsetIndexBuilder};
use crate::parallel::distributor::WorkDistributor;
use crate::parallel::processor::{CancellationToken, FailedBatch, ParallelProcessor};
use crate::parallel::transform::RecordTransform;
use crate::storage::layout::StorageLayout;
use crate::writer::batch::BatchWriter;
use crate::writer::metadata_store::MetadataStore;

/// Ties the pipeline together: index → groups → partition → workers → writer.
pub struct Engine {
    config: Config,

    storage: Arc<StorageLayout>,

    index: Arc<OffsetIndex>,
    groups: Arc<GroupIndex>,   // Built once, read-only afterwards

    processor: ParallelProcessor,
}

impl Engine {
    /// Load or build both indexes for `config.archive_path`.
    pub fn open(config: Config, extractor: Arc<dyn AttributeExtractor>) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(StorageLayout::new(&config)?);

        let index = OffsetIndexBuilder::from_config(&config, extractor)
            .open_or_build(config.force_rebuild, config.show_progress)?;
        let groups = GroupIndexBuilder::new(&index).load_or_build(&storage.group_index_path())?;

        let processor = ParallelProcessor::new(storage.archive_path.clone(), config.workers)?;

        info!(
            "Opened {}: {} records, {} groups, {} workers",
            storage.archive_path.display(),
            index.record_count(),
            groups.group_count(),
            config.workers
        );

        Ok(Engine {
            config,
            storage,
            index: Arc::new(index),
            groups: Arc::new(groups),
            processor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    pub fn index(&self) -> &OffsetIndex {
        &self.index
    }

    pub fn groups(&self) -> &GroupIndex {
        &self.groups
    }

    pub fn processor(&self) -> &ParallelProcessor {
        &self.processor
    }

    /// Cancelling stops workers between records; the run still flushes. Each
    /// run starts uncancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.processor.cancellation()
    }

    /// Process every record in the archive.
    pub fn run<T>(&self, transform: &T, store: Box<dyn MetadataStore>) -> Result<RunSummary>
    where
        T: RecordTransform + ?Sized,
    {
        self.run_ids(&self.index.all_ids(), transform, store)
    }

    /// Process only `ids`. Batches whose worker died are retried alone with
    /// their remaining ids; whatever still fails is skipped and counted.
    ///
    /// `Err` means nothing ran. Once work has started the summary is always
    /// returned, with a fatal error in `RunSummary::fatal`.
    pub fn run_ids<T>(&self, ids: &[RecordId], transform: &T, store: Box<dyn MetadataStore>) -> Result<RunSummary>
    where
        T: RecordTransform + ?Sized,
    {
        let start = Instant::now();
        self.processor.cancellation().reset();
        let writer = BatchWriter::from_config(&self.config, store);
        let distributor = WorkDistributor::new(&self.index);
        let batches = distributor.partition(
            self.config.partition_strategy,
            ids,
            self.config.workers,
            Some(&*self.groups),
        )?;

        let mut summary = RunSummary::default();
        let mut fatal: Option<Error> = None;

        let mut pending = match self.processor.process_all(batches, transform, &writer) {
            Ok(stats) => absorb(&mut summary, &stats),
            Err(e) => {
                fatal = Some(e);
                Vec::new()
            }
        };

        let mut round = 0;
        while !pending.is_empty() {
            let (retryable, lost): (Vec<FailedBatch>, Vec<FailedBatch>) =
                pending.into_iter().partition(|failed| failed.cause.is_retryable());
            for failed in lost {
                skip(&mut summary, &failed);
                if fatal.is_none() {
                    fatal = Some(failed.to_error());
                }
            }

            if retryable.is_empty() {
                break;
            }
            if fatal.is_some() || round >= self.config.max_batch_retries || self.cancellation().is_cancelled() {
                for failed in &retryable {
                    warn!(
                        "Skipping batch {} ({} records) after {} retries",
                        failed.batch_index,
                        failed.remaining.len(),
                        round
                    );
                    skip(&mut summary, failed);
                }
                break;
            }

            round += 1;
            let rebuilt: Result<Vec<_>> = retryable
                .iter()
                .map(|failed| distributor.rebuild_batch(failed.batch_index, &failed.remaining))
                .collect();
            let batches = match rebuilt {
                Ok(batches) => batches,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            info!("Retrying {} failed batches (round {})", batches.len(), round);
            summary.retried_batches += batches.len();

            pending = match self.processor.process_all(batches, transform, &writer) {
                Ok(stats) => absorb(&mut summary, &stats),
                Err(e) => {
                    fatal = Some(e);
                    Vec::new()
                }
            };
        }

        // Always runs, including after cancellation or a fatal batch
        if let Err(e) = writer.finish() {
            error!("Final flush failed: {}", e);
            fatal.get_or_insert(e);
        }
        summary.writer = writer.stats();
        summary.elapsed = start.elapsed();
        summary.rate = per_second(summary.processed, summary.elapsed);

        if let Some(e) = fatal {
            error!(
                "Run aborted after {} processed, {} errors, {} skipped batches: {}",
                summary.processed, summary.errors, summary.skipped_batches, e
            );
            summary.fatal = Some(e);
            return Ok(summary);
        }

        info!(
            "Run complete: {} processed, {} errors, {} skipped batches, {} cancelled in {:.1}s ({:.0} records/sec)",
            summary.processed,
            summary.errors,
            summary.skipped_batches,
            summary.cancelled,
            summary.elapsed.as_secs_f64(),
            summary.rate
        );
        Ok(summary)
    }
}

fn absorb(summary: &mut RunSummary, stats: &ProcessingStats) -> Vec<FailedBatch> {
    summary.processed += stats.processed;
    summary.errors += stats.errors;
    summary.cancelled += stats.cancelled_records();
    stats.failed_batches()
}

fn skip(summary: &mut RunSummary, failed: &FailedBatch) {
    summary.skipped_batches += 1;
    summary.skipped_records += failed.remaining.len() as u64;
}
