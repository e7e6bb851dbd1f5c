use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::str::FromStr;
use log::debug;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{RecordId, WorkBatch, WorkItem};
use crate::index::group_index::GroupIndex;
use crate::index::offset_index::OffsetIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStrategy {
    /// Even batch sizes by count
    Balanced,
    /// Keep each group inside one batch where possible
    Locality,
}

impl FromStr for PartitionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "balanced" => Ok(PartitionStrategy::Balanced),
            "locality" => Ok(PartitionStrategy::Locality),
            other => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("unknown partition strategy '{}' (expected balanced or locality)", other),
            )),
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PartitionStrategy::Balanced => write!(f, "balanced"),
            PartitionStrategy::Locality => write!(f, "locality"),
        }
    }
}

/// Splits record ids into exclusive batches. Output is a pure function of the
/// strategy and inputs.
pub struct WorkDistributor<'a> {
    index: &'a OffsetIndex,
}

impl<'a> WorkDistributor<'a> {
    pub fn new(index: &'a OffsetIndex) -> Self {
        WorkDistributor { index }
    }

    pub fn partition(
        &self,
        strategy: PartitionStrategy,
        ids: &[RecordId],
        n: usize,
        group_index: Option<&GroupIndex>,
    ) -> Result<Vec<WorkBatch>> {
        let batches = match (strategy, group_index) {
            (PartitionStrategy::Balanced, _) => self.balanced_partition(ids, n)?,
            (PartitionStrategy::Locality, Some(groups)) => self.locality_partition(ids, n, groups)?,
            (PartitionStrategy::Locality, None) => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "locality partitioning needs a group index".to_string(),
                ));
            }
        };

        if log::log_enabled!(log::Level::Debug) {
            let sizes: Vec<usize> = batches.iter().map(WorkBatch::len).collect();
            debug!(
                "{} partition of {} ids: min={} max={} batches={}",
                strategy,
                ids.len(),
                sizes.iter().min().copied().unwrap_or(0),
                sizes.iter().max().copied().unwrap_or(0),
                sizes.len()
            );
        }
        Ok(batches)
    }

    /// `n` contiguous runs whose sizes differ by at most one. Input order is kept.
    pub fn balanced_partition(&self, ids: &[RecordId], n: usize) -> Result<Vec<WorkBatch>> {
        self.check_input(ids, n)?;
        let items = self.index.work_items(ids)?;

        let base = items.len() / n;
        let extra = items.len() % n;
        let mut remaining = items.into_iter();
        let batches = (0..n)
            .map(|i| {
                let size = base + usize::from(i < extra);
                WorkBatch::new(i, remaining.by_ref().take(size).collect())
            })
            .collect();
        Ok(batches)
    }

    /// Keep every group's ids together unless the group alone exceeds the fair
    /// share `ceil(len / n)`, in which case it is cut into fair-share chunks.
    /// Units are placed largest first onto the least loaded batch.
    pub fn locality_partition(
        &self,
        ids: &[RecordId],
        n: usize,
        group_index: &GroupIndex,
    ) -> Result<Vec<WorkBatch>> {
        self.check_input(ids, n)?;
        let fair_share = ids.len().div_ceil(n).max(1);

        let wanted: HashSet<RecordId> = ids.iter().copied().collect();
        let mut placed: HashSet<RecordId> = HashSet::with_capacity(ids.len());
        let mut units: Vec<Vec<RecordId>> = Vec::new();

        for (_, members) in group_index.groups() {
            let present: Vec<RecordId> = members.iter().copied().filter(|id| wanted.contains(id)).collect();
            if present.is_empty() {
                continue;
            }
            placed.extend(present.iter().copied());
            units.extend(present.chunks(fair_share).map(<[RecordId]>::to_vec));
        }
        // Ungrouped ids travel alone
        units.extend(ids.iter().filter(|id| !placed.contains(id)).map(|&id| vec![id]));

        units.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));

        let mut assigned: Vec<Vec<RecordId>> = vec![Vec::new(); n];
        let mut load: BinaryHeap<Reverse<(usize, usize)>> = (0..n).map(|i| Reverse((0, i))).collect();
        for unit in units {
            let Some(Reverse((size, slot))) = load.pop() else { break };
            load.push(Reverse((size + unit.len(), slot)));
            assigned[slot].extend(unit);
        }

        assigned
            .into_iter()
            .enumerate()
            .map(|(i, mut batch_ids)| {
                batch_ids.sort_unstable();
                Ok(WorkBatch::new(i, self.index.work_items(&batch_ids)?))
            })
            .collect()
    }

    /// Rebuild a batch for ids left over by a failed worker.
    pub fn rebuild_batch(&self, batch_index: usize, ids: &[RecordId]) -> Result<WorkBatch> {
        Ok(WorkBatch::new(batch_index, self.index.work_items(ids)?))
    }

    fn check_input(&self, ids: &[RecordId], n: usize) -> Result<()> {
        if n == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument, "cannot partition into 0 batches".to_string()));
        }
        let mut seen = HashSet::with_capacity(ids.len());
        for &id in ids {
            if !seen.insert(id) {
                return Err(Error::new(ErrorKind::InvalidArgument, format!("record {} listed twice", id)));
            }
            if id.0 >= self.index.record_count() {
                return Err(Error::new(ErrorKind::NotFound, format!("record {} not in index", id)));
            }
        }
        Ok(())
    }
}

/// Flatten batches back to ids, in batch order.
pub fn flatten_ids(batches: &[WorkBatch]) -> Vec<RecordId> {
    batches.iter().flat_map(|batch| batch.items.iter().map(|item: &WorkItem| item.record_id)).collect()
}
