use std::collections::HashMap;
use std::path::Path;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::core::error::{ErrorKind, Result};
use crate::core::stats::GroupStats;
use crate::core::types::RecordId;
use crate::index::offset_index::OffsetIndex;
use crate::storage::index_file::{read_checksummed, write_checksummed};

pub const GROUP_MAGIC: &[u8; 8] = b"MBXGRP\0\0";
pub const GROUP_SCHEMA_VERSION: u32 = 1;

/// group key -> ids and secondary key -> ids, precomputed once per index.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupIndex {
    source_crc: u32,
    record_count: u64,
    groups: HashMap<String, Vec<RecordId>>,
    secondary: HashMap<String, Vec<RecordId>>,
    group_order: Vec<String>,
    secondary_order: Vec<String>,
}

/// Sorted, deterministic on-disk form
#[derive(Debug, Serialize, Deserialize)]
struct GroupIndexFile {
    source_crc: u32,
    record_count: u64,
    groups: Vec<(String, Vec<RecordId>)>,
    secondary: Vec<(String, Vec<RecordId>)>,
}

impl GroupIndex {
    fn from_maps(
        source_crc: u32,
        record_count: u64,
        groups: HashMap<String, Vec<RecordId>>,
        secondary: HashMap<String, Vec<RecordId>>,
    ) -> Self {
        let mut group_order: Vec<String> = groups.keys().cloned().collect();
        group_order.sort();
        let mut secondary_order: Vec<String> = secondary.keys().cloned().collect();
        secondary_order.sort();
        GroupIndex {
            source_crc,
            record_count,
            groups,
            secondary,
            group_order,
            secondary_order,
        }
    }

    /// Whether this was built from exactly `index`.
    pub fn is_built_from(&self, index: &OffsetIndex) -> bool {
        self.source_crc == index.body_crc() && self.record_count == index.record_count()
    }

    /// O(1). Ids ascending; empty for unknown keys.
    pub fn ids_for_group(&self, group_key: &str) -> &[RecordId] {
        self.groups.get(group_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ids_for_secondary(&self, secondary_key: &str) -> &[RecordId] {
        self.secondary.get(secondary_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn secondary_count(&self) -> usize {
        self.secondary.len()
    }

    /// Groups in key order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &[RecordId])> + '_ {
        self.group_order
            .iter()
            .map(move |key| (key.as_str(), self.ids_for_group(key)))
    }

    pub fn secondary_groups(&self) -> impl Iterator<Item = (&str, &[RecordId])> + '_ {
        self.secondary_order
            .iter()
            .map(move |key| (key.as_str(), self.ids_for_secondary(key)))
    }

    pub fn group_sizes(&self) -> Vec<(String, usize)> {
        self.groups().map(|(key, ids)| (key.to_string(), ids.len())).collect()
    }

    /// Largest groups first; ties broken by key.
    pub fn largest_groups(&self, limit: usize) -> Vec<(String, usize)> {
        largest(self.groups(), limit)
    }

    pub fn largest_secondary(&self, limit: usize) -> Vec<(String, usize)> {
        largest(self.secondary_groups(), limit)
    }

    pub fn group_stats(&self) -> GroupStats {
        stats(self.groups.values().map(Vec::len))
    }

    pub fn secondary_stats(&self) -> GroupStats {
        stats(self.secondary.values().map(Vec::len))
    }

    pub fn save(&self, path: &Path) -> Result<u64> {
        let file = GroupIndexFile {
            source_crc: self.source_crc,
            record_count: self.record_count,
            groups: self.groups().map(|(k, ids)| (k.to_string(), ids.to_vec())).collect(),
            secondary: self.secondary_groups().map(|(k, ids)| (k.to_string(), ids.to_vec())).collect(),
        };
        let (bytes, _) = write_checksummed(path, GROUP_MAGIC, GROUP_SCHEMA_VERSION, &file)?;
        Ok(bytes)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = read_checksummed::<GroupIndexFile>(path, GROUP_MAGIC, GROUP_SCHEMA_VERSION)?.body;
        Ok(GroupIndex::from_maps(
            file.source_crc,
            file.record_count,
            file.groups.into_iter().collect(),
            file.secondary.into_iter().collect(),
        ))
    }
}

fn largest<'a>(groups: impl Iterator<Item = (&'a str, &'a [RecordId])>, limit: usize) -> Vec<(String, usize)> {
    let mut sizes: Vec<(String, usize)> = groups.map(|(key, ids)| (key.to_string(), ids.len())).collect();
    sizes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sizes.truncate(limit);
    sizes
}

fn stats(sizes: impl Iterator<Item = usize>) -> GroupStats {
    let sizes: Vec<usize> = sizes.collect();
    let total: usize = sizes.iter().sum();
    GroupStats {
        count: sizes.len(),
        total_records: total,
        avg_size: if sizes.is_empty() { 0.0 } else { total as f64 / sizes.len() as f64 },
        max_size: sizes.iter().copied().max().unwrap_or(0),
        min_size: sizes.iter().copied().min().unwrap_or(0),
    }
}

/// Folds index attributes into a `GroupIndex` without reading the archive.
pub struct GroupIndexBuilder<'a> {
    index: &'a OffsetIndex,
}

impl<'a> GroupIndexBuilder<'a> {
    pub fn new(index: &'a OffsetIndex) -> Self {
        GroupIndexBuilder { index }
    }

    /// One pass over the index entries, O(records).
    pub fn build(&self) -> GroupIndex {
        let mut groups: HashMap<String, Vec<RecordId>> = HashMap::new();
        let mut secondary: HashMap<String, Vec<RecordId>> = HashMap::new();

        // Entries are in id order, so every list comes out ascending.
        for entry in self.index.entries() {
            let id = entry.location.record_id;
            if let Some(key) = &entry.attributes.group_key {
                groups.entry(key.clone()).or_default().push(id);
            }
            if let Some(key) = &entry.attributes.secondary_key {
                secondary.entry(key.clone()).or_default().push(id);
            }
        }

        let group_index = GroupIndex::from_maps(
            self.index.body_crc(),
            self.index.record_count(),
            groups,
            secondary,
        );
        let stats = group_index.group_stats();
        info!(
            "Built group index: {} groups (avg {:.1} records), {} secondary keys",
            stats.count,
            stats.avg_size,
            group_index.secondary_count()
        );
        group_index
    }

    /// Reuse the persisted group index if it belongs to this offset index,
    /// otherwise rebuild and persist it.
    pub fn load_or_build(&self, path: &Path) -> Result<GroupIndex> {
        match GroupIndex::load(path) {
            Ok(groups) if groups.is_built_from(self.index) => {
                debug!("Loaded group index from {}", path.display());
                return Ok(groups);
            }
            Ok(_) => info!("Group index {} belongs to another index build", path.display()),
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => warn!("Discarding group index {}: {}", path.display(), e),
        }

        let groups = self.build();
        groups.save(path)?;
        Ok(groups)
    }
}
