use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use crossbeam::channel::unbounded;
use log::{error, info, trace, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{per_second, ProcessingStats};
use crate::core::types::{RecordId, TransformResult, WorkBatch, WorkItem};
use crate::mmap::record_view::RecordView;
use crate::parallel::transform::RecordTransform;

/// Receives transform results from all workers concurrently.
pub trait ResultSink: Send + Sync {
    fn queue(&self, result: TransformResult) -> Result<()>;
}

/// Cooperative shutdown flag, checked by workers between records.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-worker state. `Idle → Reading → Transforming → Emitting → Idle` for each
/// item, ending in `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reading,
    Transforming,
    Emitting,
    Done,
    Failed,
}

/// Why a worker stopped before finishing its batch
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The archive could not be mapped for this worker.
    ViewUnavailable(String),
    /// The worker died while handling a record.
    Panicked(String),
    /// Index and archive disagree.
    OutOfBounds(String),
    /// Output could not be handed to the sink.
    Sink(String),
}

impl FailureCause {
    /// Worker-level faults can be retried with just the remaining ids.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureCause::ViewUnavailable(_) | FailureCause::Panicked(_))
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            FailureCause::ViewUnavailable(_) | FailureCause::Panicked(_) => ErrorKind::WorkerFault,
            FailureCause::OutOfBounds(_) => ErrorKind::RecordOutOfBounds,
            FailureCause::Sink(_) => ErrorKind::SinkWriteFailure,
        }
    }

    fn message(&self) -> &str {
        match self {
            FailureCause::ViewUnavailable(m)
            | FailureCause::Panicked(m)
            | FailureCause::OutOfBounds(m)
            | FailureCause::Sink(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed,
    Cancelled { remaining: Vec<RecordId> },
    Failed { cause: FailureCause, remaining: Vec<RecordId> },
}

/// Ids a dead worker never got to, with the reason it died
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    pub batch_index: usize,
    pub cause: FailureCause,
    pub remaining: Vec<RecordId>,
}

impl FailedBatch {
    pub fn to_error(&self) -> Error {
        Error::new(
            self.cause.error_kind(),
            format!(
                "batch {} stopped with {} records left: {}",
                self.batch_index,
                self.remaining.len(),
                self.cause.message()
            ),
        )
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_index: usize,
    pub processed: u64,
    pub errors: u64,
    /// Records whose transform failed
    pub failed_ids: Vec<RecordId>,
    pub elapsed: Duration,
    pub final_state: WorkerState,
    pub outcome: BatchOutcome,
}

impl BatchReport {
    pub fn failure(&self) -> Option<FailedBatch> {
        match &self.outcome {
            BatchOutcome::Failed { cause, remaining } => Some(FailedBatch {
                batch_index: self.batch_index,
                cause: cause.clone(),
                remaining: remaining.clone(),
            }),
            _ => None,
        }
    }

    pub fn cancelled_ids(&self) -> &[RecordId] {
        match &self.outcome {
            BatchOutcome::Cancelled { remaining } => remaining,
            _ => &[],
        }
    }
}

enum Stop {
    Exhausted,
    Cancelled,
}

/// One worker's view of its batch. Counters stay local until the batch ends.
struct Worker<'a, T: ?Sized, S: ?Sized> {
    batch_index: usize,
    view: RecordView,
    transform: &'a T,
    sink: &'a S,
    cancel: &'a CancellationToken,
    state: WorkerState,
    processed: u64,
    errors: u64,
    failed_ids: Vec<RecordId>,
}

impl<'a, T, S> Worker<'a, T, S>
where
    T: RecordTransform + ?Sized,
    S: ResultSink + ?Sized,
{
    /// Process `items[*next..]`, advancing `next` past every finished item.
    fn run(&mut self, items: &[WorkItem], next: &mut usize) -> std::result::Result<Stop, FailureCause> {
        while let Some(item) = items.get(*next) {
            if self.cancel.is_cancelled() {
                return Ok(Stop::Cancelled);
            }
            self.process(item)?;
            *next += 1;
        }
        Ok(Stop::Exhausted)
    }

    fn process(&mut self, item: &WorkItem) -> std::result::Result<(), FailureCause> {
        enter(self.batch_index, &mut self.state, WorkerState::Reading);
        let raw = self
            .view
            .read(item.byte_offset, item.byte_length)
            .map_err(|e| FailureCause::OutOfBounds(format!("record {}: {}", item.record_id, e.context)))?;

        enter(self.batch_index, &mut self.state, WorkerState::Transforming);
        match self.transform.transform(raw) {
            Ok(output) => {
                enter(self.batch_index, &mut self.state, WorkerState::Emitting);
                self.sink
                    .queue(TransformResult::new(item, output))
                    .map_err(|e| FailureCause::Sink(format!("record {}: {}", item.record_id, e)))?;
                self.processed += 1;
            }
            Err(e) => {
                warn!("Transform failed for record {}: {}", item.record_id, e);
                self.errors += 1;
                self.failed_ids.push(item.record_id);
            }
        }
        enter(self.batch_index, &mut self.state, WorkerState::Idle);
        Ok(())
    }
}

/// Borrows only the state field, so a record slice borrowed from the view can
/// stay alive across the transition.
fn enter(batch_index: usize, state: &mut WorkerState, next: WorkerState) {
    trace!("batch {}: {:?} -> {:?}", batch_index, state, next);
    *state = next;
}

/// Runs batches on a bounded pool of worker threads.
pub struct ParallelProcessor {
    archive_path: PathBuf,
    pool: rayon::ThreadPool,
    workers: usize,
    cancel: CancellationToken,
    completed_records: AtomicU64,
}

impl ParallelProcessor {
    pub fn new(archive_path: impl Into<PathBuf>, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument, "workers must be at least 1".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("mboxdex-worker-{}", i))
            .build()
            .map_err(|e| Error::new(ErrorKind::Internal, format!("worker pool: {}", e)))?;

        Ok(ParallelProcessor {
            archive_path: archive_path.into(),
            pool,
            workers,
            cancel: CancellationToken::new(),
            completed_records: AtomicU64::new(0),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Records finished so far, updated once per completed batch.
    pub fn completed_records(&self) -> u64 {
        self.completed_records.load(Ordering::Relaxed)
    }

    /// One task per batch; at most `workers` run at once, the rest queue.
    /// Batches may finish in any order; items within a batch run in order.
    pub fn process_all<T, S>(&self, batches: Vec<WorkBatch>, transform: &T, sink: &S) -> Result<ProcessingStats>
    where
        T: RecordTransform + ?Sized,
        S: ResultSink + ?Sized,
    {
        let start = Instant::now();
        let batch_count = batches.len();
        let total_records: usize = batches.iter().map(WorkBatch::len).sum();
        info!(
            "Processing {} records in {} batches with {} workers",
            total_records, batch_count, self.workers
        );

        let (tx, rx) = unbounded::<BatchReport>();
        let archive_path = &self.archive_path;
        let cancel = &self.cancel;

        let reports = self.pool.in_place_scope(|scope| {
            for batch in batches {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let report = run_batch(archive_path, batch, transform, sink, cancel);
                    let _ = tx.send(report);
                });
            }
            drop(tx);

            let mut reports = Vec::with_capacity(batch_count);
            for report in rx.iter() {
                let done = self
                    .completed_records
                    .fetch_add(report.processed + report.errors, Ordering::Relaxed)
                    + report.processed
                    + report.errors;
                info!(
                    "Batch {} {:?}: {} processed, {} errors in {:.1}s ({}/{} records done)",
                    report.batch_index,
                    report.final_state,
                    report.processed,
                    report.errors,
                    report.elapsed.as_secs_f64(),
                    done,
                    total_records
                );
                reports.push(report);
            }
            reports
        });

        let mut stats = ProcessingStats {
            elapsed: start.elapsed(),
            ..ProcessingStats::default()
        };
        for report in &reports {
            stats.processed += report.processed;
            stats.errors += report.errors;
        }
        stats.rate = per_second(stats.processed, stats.elapsed);
        stats.batches = reports;
        stats.batches.sort_by_key(|report| report.batch_index);

        info!(
            "Processing complete: {} records in {:.1}s ({:.0} records/sec, {} errors, {} failed batches)",
            stats.processed,
            stats.elapsed.as_secs_f64(),
            stats.rate,
            stats.errors,
            stats.failed_batches().len()
        );
        Ok(stats)
    }
}

fn run_batch<T, S>(
    archive_path: &Path,
    batch: WorkBatch,
    transform: &T,
    sink: &S,
    cancel: &CancellationToken,
) -> BatchReport
where
    T: RecordTransform + ?Sized,
    S: ResultSink + ?Sized,
{
    let start = Instant::now();
    let view = match RecordView::open(archive_path) {
        Ok(view) => view,
        Err(e) => {
            error!("Batch {}: cannot map {}: {}", batch.index, archive_path.display(), e);
            return BatchReport {
                batch_index: batch.index,
                processed: 0,
                errors: 0,
                failed_ids: Vec::new(),
                elapsed: start.elapsed(),
                final_state: WorkerState::Failed,
                outcome: BatchOutcome::Failed {
                    cause: FailureCause::ViewUnavailable(e.to_string()),
                    remaining: batch.ids(),
                },
            };
        }
    };

    let mut worker = Worker {
        batch_index: batch.index,
        view,
        transform,
        sink,
        cancel,
        state: WorkerState::Idle,
        processed: 0,
        errors: 0,
        failed_ids: Vec::new(),
    };
    let mut next = 0usize;
    let result = panic::catch_unwind(AssertUnwindSafe(|| worker.run(&batch.items, &mut next)));

    let remaining = || batch.items[next..].iter().map(|item| item.record_id).collect::<Vec<_>>();
    let (final_state, outcome) = match result {
        Ok(Ok(Stop::Exhausted)) => (WorkerState::Done, BatchOutcome::Completed),
        Ok(Ok(Stop::Cancelled)) => (WorkerState::Done, BatchOutcome::Cancelled { remaining: remaining() }),
        Ok(Err(cause)) => {
            error!("Batch {} failed: {}", batch.index, cause.message());
            (WorkerState::Failed, BatchOutcome::Failed { cause, remaining: remaining() })
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let at = batch.items.get(next).map(|item| item.record_id.to_string()).unwrap_or_default();
            error!("Worker for batch {} died at record {}: {}", batch.index, at, message);
            (
                WorkerState::Failed,
                BatchOutcome::Failed {
                    cause: FailureCause::Panicked(message),
                    remaining: remaining(),
                },
            )
        }
    };

    BatchReport {
        batch_index: batch.index,
        processed: worker.processed,
        errors: worker.errors,
        failed_ids: worker.failed_ids,
        elapsed: start.elapsed(),
        final_state,
        outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TransformOutput;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect(Mutex<Vec<TransformResult>>);

    impl ResultSink for Collect {
        fn queue(&self, result: TransformResult) -> Result<()> {
            self.0.lock().push(result);
            Ok(())
        }
    }

    fn item(id: u64, byte_offset: u64, byte_length: u64) -> WorkItem {
        WorkItem {
            record_id: RecordId(id),
            byte_offset,
            byte_length,
            group_key: None,
            secondary_key: None,
        }
    }

    #[test]
    fn worker_walks_states_and_returns_to_idle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mbox");
        fs::write(&path, b"first|second").unwrap();

        let transform = |record: &[u8]| -> Result<TransformOutput> {
            Ok(TransformOutput {
                rendered_artifact: record.to_vec(),
                metadata: Default::default(),
                fingerprint: Vec::new(),
            })
        };
        let sink = Collect::default();
        let cancel = CancellationToken::new();
        let mut worker = Worker {
            batch_index: 0,
            view: RecordView::open(&path).unwrap(),
            transform: &transform,
            sink: &sink,
            cancel: &cancel,
            state: WorkerState::Idle,
            processed: 0,
            errors: 0,
            failed_ids: Vec::new(),
        };

        let items = [item(0, 0, 6), item(1, 6, 6)];
        let mut next = 0;
        assert!(matches!(worker.run(&items, &mut next), Ok(Stop::Exhausted)));
        assert_eq!(next, 2);
        assert_eq!(worker.state, WorkerState::Idle);
        assert_eq!(worker.processed, 2);

        let results = sink.0.lock();
        assert_eq!(results[0].rendered_artifact, b"first|");
        assert_eq!(results[1].rendered_artifact, b"second");
    }

    #[test]
    fn out_of_bounds_read_stops_in_reading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mbox");
        fs::write(&path, b"short").unwrap();

        let sink = Collect::default();
        let cancel = CancellationToken::new();
        let mut worker = Worker {
            batch_index: 3,
            view: RecordView::open(&path).unwrap(),
            transform: &crate::parallel::transform::RawRecordTransform,
            sink: &sink,
            cancel: &cancel,
            state: WorkerState::Idle,
            processed: 0,
            errors: 0,
            failed_ids: Vec::new(),
        };

        let cause = worker.process(&item(0, 2, 10)).unwrap_err();
        assert_eq!(cause.error_kind(), ErrorKind::RecordOutOfBounds);
        assert_eq!(worker.state, WorkerState::Reading);
        assert!(sink.0.lock().is_empty());
    }
}
