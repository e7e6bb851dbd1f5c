mod common;

use std::fs::{self, OpenOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use mboxdex::core::error::{Error, ErrorKind, Result};
use mboxdex::core::types::{RecordId, TransformOutput, TransformResult};
use mboxdex::parallel::distributor::WorkDistributor;
use mboxdex::parallel::processor::{BatchOutcome, FailureCause, ParallelProcessor, ResultSink, WorkerState};
use mboxdex::parallel::transform::{RawRecordTransform, RecordTransform};
use tempfile::TempDir;

#[derive(Default)]
struct CollectingSink {
    results: Mutex<Vec<TransformResult>>,
}

impl CollectingSink {
    fn ids(&self) -> Vec<RecordId> {
        self.results.lock().iter().map(|r| r.record_id).collect()
    }
}

impl ResultSink for CollectingSink {
    fn queue(&self, result: TransformResult) -> Result<()> {
        self.results.lock().push(result);
        Ok(())
    }
}

struct RejectingSink;

impl ResultSink for RejectingSink {
    fn queue(&self, _result: TransformResult) -> Result<()> {
        Err(Error::new(ErrorKind::Io, "disk full".to_string()))
    }
}

fn is_message(record: &[u8], n: usize) -> bool {
    let needle = format!("Subject: Message {}\n", n);
    record.windows(needle.len()).any(|w| w == needle.as_bytes())
}

#[test]
fn one_bad_record_does_not_stop_the_run() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(1000));
    let index = common::build_index(&archive, dir.path());
    let batches = WorkDistributor::new(&index).balanced_partition(&index.all_ids(), 4)?;

    let transform = |record: &[u8]| -> Result<TransformOutput> {
        if is_message(record, 500) {
            return Err(Error::transform("malformed message"));
        }
        RawRecordTransform.transform(record)
    };
    let sink = CollectingSink::default();
    let processor = ParallelProcessor::new(&archive, 4)?;
    let stats = processor.process_all(batches, &transform, &sink)?;

    assert_eq!(stats.processed, 999);
    assert_eq!(stats.errors, 1);
    assert!(stats.failed_batches().is_empty());
    assert_eq!(processor.completed_records(), 1000);

    let mut ids = sink.ids();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 999);
    assert!(!ids.contains(&RecordId(500)));

    let report = stats.batches.iter().find(|r| r.errors == 1).unwrap();
    assert_eq!(report.failed_ids, vec![RecordId(500)]);
    assert_eq!(report.final_state, WorkerState::Done);
    assert_eq!(report.outcome, BatchOutcome::Completed);
    Ok(())
}

#[test]
fn items_in_a_batch_are_processed_in_order() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(20));
    let index = common::build_index(&archive, dir.path());

    let mut ids = index.all_ids();
    ids.reverse();
    let batches = WorkDistributor::new(&index).balanced_partition(&ids, 1)?;

    let sink = CollectingSink::default();
    ParallelProcessor::new(&archive, 2)?.process_all(batches, &RawRecordTransform, &sink)?;
    assert_eq!(sink.ids(), ids);
    Ok(())
}

#[test]
fn panicking_worker_reports_remaining_ids() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(12));
    let index = common::build_index(&archive, dir.path());
    let batches = WorkDistributor::new(&index).balanced_partition(&index.all_ids(), 3)?;

    let transform = |record: &[u8]| -> Result<TransformOutput> {
        if is_message(record, 5) {
            panic!("transform blew up");
        }
        RawRecordTransform.transform(record)
    };
    let sink = CollectingSink::default();
    let stats = ParallelProcessor::new(&archive, 3)?.process_all(batches, &transform, &sink)?;

    // Batch 1 holds ids 4..8 and dies on id 5
    let failed = stats.failed_batches();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].batch_index, 1);
    assert_eq!(failed[0].remaining, vec![RecordId(5), RecordId(6), RecordId(7)]);
    assert!(matches!(failed[0].cause, FailureCause::Panicked(ref m) if m.contains("blew up")));
    assert!(failed[0].cause.is_retryable());
    assert_eq!(failed[0].to_error().kind, ErrorKind::WorkerFault);

    assert_eq!(stats.processed, 9);
    let report = &stats.batches[1];
    assert_eq!(report.final_state, WorkerState::Failed);
    assert_eq!(report.processed, 1);
    Ok(())
}

#[test]
fn cancellation_stops_between_records() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(10));
    let index = common::build_index(&archive, dir.path());
    let batches = WorkDistributor::new(&index).balanced_partition(&index.all_ids(), 1)?;

    let processor = ParallelProcessor::new(&archive, 1)?;
    let token = processor.cancellation();
    let seen = AtomicUsize::new(0);
    let transform = |record: &[u8]| -> Result<TransformOutput> {
        if seen.fetch_add(1, Ordering::SeqCst) == 2 {
            token.cancel();
        }
        RawRecordTransform.transform(record)
    };
    let sink = CollectingSink::default();
    let stats = processor.process_all(batches, &transform, &sink)?;

    // The record in flight when cancel was requested still completes
    assert_eq!(stats.processed, 3);
    assert_eq!(sink.ids(), vec![RecordId(0), RecordId(1), RecordId(2)]);
    assert_eq!(stats.cancelled_records(), 7);
    assert_eq!(stats.batches[0].cancelled_ids()[0], RecordId(3));
    assert!(stats.failed_batches().is_empty());
    Ok(())
}

#[test]
fn archive_shrunk_under_the_index_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(6));
    let index = common::build_index(&archive, dir.path());
    let batches = WorkDistributor::new(&index).balanced_partition(&index.all_ids(), 2)?;

    let len = fs::metadata(&archive)?.len();
    OpenOptions::new().write(true).open(&archive)?.set_len(len / 2)?;

    let sink = CollectingSink::default();
    let stats = ParallelProcessor::new(&archive, 2)?.process_all(batches, &RawRecordTransform, &sink)?;
    let failed = stats.failed_batches();
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0].cause, FailureCause::OutOfBounds(_)));
    assert!(!failed[0].cause.is_retryable());
    assert_eq!(failed[0].to_error().kind, ErrorKind::RecordOutOfBounds);
    Ok(())
}

#[test]
fn sink_failure_fails_the_batch() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(4));
    let index = common::build_index(&archive, dir.path());
    let batches = WorkDistributor::new(&index).balanced_partition(&index.all_ids(), 1)?;

    let stats = ParallelProcessor::new(&archive, 1)?.process_all(batches, &RawRecordTransform, &RejectingSink)?;
    let failed = stats.failed_batches();
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0].cause, FailureCause::Sink(_)));
    assert_eq!(failed[0].remaining.len(), 4);
    assert_eq!(stats.processed, 0);
    Ok(())
}

#[test]
fn missing_archive_is_a_retryable_worker_fault() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(2));
    let index = common::build_index(&archive, dir.path());
    let batches = WorkDistributor::new(&index).balanced_partition(&index.all_ids(), 1)?;

    let processor = ParallelProcessor::new(dir.path().join("gone.mbox"), 1)?;
    let stats = processor.process_all(batches, &RawRecordTransform, &CollectingSink::default())?;
    let failed = stats.failed_batches();
    assert!(matches!(failed[0].cause, FailureCause::ViewUnavailable(_)));
    assert!(failed[0].cause.is_retryable());
    assert_eq!(failed[0].remaining, vec![RecordId(0), RecordId(1)]);
    Ok(())
}

#[test]
fn zero_workers_is_rejected() {
    let err = ParallelProcessor::new("archive.mbox", 0).err().unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}
