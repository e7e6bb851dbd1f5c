mod common;

use std::collections::HashSet;
use mboxdex::core::error::{ErrorKind, Result};
use mboxdex::core::types::RecordId;
use mboxdex::index::group_index::GroupIndexBuilder;
use mboxdex::parallel::distributor::{flatten_ids, PartitionStrategy, WorkDistributor};
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

#[test]
fn balanced_partition_is_complete_for_any_n() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(37));
    let index = common::build_index(&archive, dir.path());
    let distributor = WorkDistributor::new(&index);

    let mut ids = index.all_ids();
    ids.shuffle(&mut StdRng::seed_from_u64(7));

    for n in [1, 2, 3, 8, 36, 37, 50] {
        let batches = distributor.balanced_partition(&ids, n)?;
        assert_eq!(batches.len(), n);
        assert_eq!(flatten_ids(&batches), ids, "n={}", n);

        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        let spread = sizes.iter().max().unwrap() - sizes.iter().min().unwrap();
        assert!(spread <= 1, "n={} sizes={:?}", n, sizes);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index, i);
        }
    }
    Ok(())
}

#[test]
fn locality_keeps_groups_whole() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::threaded_messages(&[("a", 40), ("b", 40), ("c", 20)]));
    let index = common::build_index(&archive, dir.path());
    let groups = GroupIndexBuilder::new(&index).build();
    let distributor = WorkDistributor::new(&index);

    let ids = index.all_ids();
    let batches = distributor.locality_partition(&ids, 2, &groups)?;
    assert_eq!(batches.len(), 2);

    let mut flattened = flatten_ids(&batches);
    flattened.sort();
    assert_eq!(flattened, ids);

    for key in ["a", "b", "c"] {
        let members: HashSet<RecordId> = groups.ids_for_group(key).iter().copied().collect();
        let holders = batches
            .iter()
            .filter(|batch| batch.items.iter().any(|item| members.contains(&item.record_id)))
            .count();
        assert_eq!(holders, 1, "group {} split across batches", key);
    }

    let mut sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![40, 60]);
    Ok(())
}

#[test]
fn oversized_group_is_split_at_fair_share() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::threaded_messages(&[("big", 9), ("small", 3)]));
    let index = common::build_index(&archive, dir.path());
    let groups = GroupIndexBuilder::new(&index).build();
    let distributor = WorkDistributor::new(&index);

    let batches = distributor.locality_partition(&index.all_ids(), 3, &groups)?;
    // Fair share is 4: "big" becomes 4 + 4 + 1
    let big: HashSet<RecordId> = groups.ids_for_group("big").iter().copied().collect();
    let spread: Vec<usize> = batches
        .iter()
        .map(|batch| batch.items.iter().filter(|item| big.contains(&item.record_id)).count())
        .collect();
    assert_eq!(spread.iter().sum::<usize>(), 9);
    assert!(spread.iter().all(|&n| n <= 4));
    assert_eq!(flatten_ids(&batches).len(), 12);
    Ok(())
}

#[test]
fn partitioning_is_deterministic() -> Result<()> {
    let dir = TempDir::new()?;
    let mut messages = common::threaded_messages(&[("a", 7), ("b", 5), ("c", 5)]);
    messages.extend((0..4).map(|i| common::message(200 + i, None, "loose.com")));
    let archive = common::write_archive(dir.path(), &messages);
    let index = common::build_index(&archive, dir.path());
    let groups = GroupIndexBuilder::new(&index).build();
    let distributor = WorkDistributor::new(&index);

    for strategy in [PartitionStrategy::Balanced, PartitionStrategy::Locality] {
        let first = distributor.partition(strategy, &index.all_ids(), 4, Some(&groups))?;
        let second = distributor.partition(strategy, &index.all_ids(), 4, Some(&groups))?;
        assert_eq!(first, second, "{}", strategy);

        let mut ids = flatten_ids(&first);
        ids.sort();
        assert_eq!(ids, index.all_ids());
    }
    Ok(())
}

#[test]
fn bad_inputs_are_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = common::write_archive(dir.path(), &common::simple_messages(4));
    let index = common::build_index(&archive, dir.path());
    let distributor = WorkDistributor::new(&index);

    let err = distributor.balanced_partition(&index.all_ids(), 0).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    let err = distributor.balanced_partition(&[RecordId(1), RecordId(1)], 2).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    let err = distributor.balanced_partition(&[RecordId(4)], 2).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    let err = distributor
        .partition(PartitionStrategy::Locality, &index.all_ids(), 2, None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    let batches = distributor.balanced_partition(&[], 3)?;
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|b| b.is_empty()));
    Ok(())
}

#[test]
fn strategy_names_parse() {
    assert_eq!("balanced".parse::<PartitionStrategy>().unwrap(), PartitionStrategy::Balanced);
    assert_eq!("Locality".parse::<PartitionStrategy>().unwrap(), PartitionStrategy::Locality);
    assert!("random".parse::<PartitionStrategy>().is_err());
}
