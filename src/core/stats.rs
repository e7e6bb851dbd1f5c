use std::time::Duration;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, Result};
use crate::parallel::processor::{BatchReport, FailedBatch};

/// Result of one offset index build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub record_count: u64,
    pub archive_bytes: u64,
    pub preamble_bytes: u64,
    pub index_size_bytes: u64,
    pub build_duration: Duration,
    /// Records per second
    pub throughput: f64,
}

/// Size profile of an index, derived without touching the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub record_count: u64,
    pub total_record_bytes: u64,
    pub avg_record_bytes: f64,
    pub max_record_bytes: u64,
    pub min_record_bytes: u64,
    pub index_file_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: usize,
    pub total_records: usize,
    pub avg_size: f64,
    pub max_size: usize,
    pub min_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterStats {
    pub flushes: u64,
    pub artifacts_written: u64,
    pub rows_written: u64,
    pub buffered_items: usize,
    pub buffered_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingStats {
    pub processed: u64,
    pub errors: u64,
    pub elapsed: Duration,
    /// Successful records per second
    pub rate: f64,
    pub batches: Vec<BatchReport>,
}

impl ProcessingStats {
    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.batches.iter().filter_map(|report| report.failure()).collect()
    }

    pub fn cancelled_records(&self) -> u64 {
        self.batches.iter().map(|report| report.cancelled_ids().len() as u64).sum()
    }
}

/// What a caller sees at the end of a run, even a partially failed one
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: u64,
    pub errors: u64,
    pub skipped_batches: usize,
    pub skipped_records: u64,
    pub retried_batches: usize,
    pub cancelled: u64,
    pub elapsed: Duration,
    pub rate: f64,
    pub writer: WriterStats,
    /// First fatal error; the counts above cover everything done before it.
    pub fatal: Option<Error>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.fatal.is_none()
    }

    /// The summary, or the fatal error that aborted the run.
    pub fn into_result(self) -> Result<RunSummary> {
        match self.fatal {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

pub(crate) fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
