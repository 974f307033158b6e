use std::collections::BTreeMap;
use std::rc::Rc;

use framedex_core::frames::SortedTree;
use framedex_core::frames::stream::{self, collect_pairs};
use framedex_core::frames::tree::merge_trees;
use framedex_core::{
    AggregateMode, ArchiveOptions, Key, LayeredArchive, SessionMapping, SorterOptions,
    TreeOptions, Value,
};
use tempfile::TempDir;

fn key(n: u32) -> Key {
    Key::new([format!("k{n:05}")])
}

fn small_tree() -> TreeOptions {
    TreeOptions {
        node_bytes: 300,
        cache_limit: 4,
    }
}

fn options(mode: AggregateMode) -> ArchiveOptions {
    ArchiveOptions {
        tree: small_tree(),
        sorter: SorterOptions {
            bucket_bytes: 500,
            max_scatter: 6,
            over_sample: 3,
            recursion_minimum: 2,
            max_depth: 5,
            seed: Some(7),
        },
        aggregate_mode: mode,
        ..ArchiveOptions::default()
    }
}

/// Publish random puts and deletes from several sessions, mirroring them in a
/// map, then return everything the final view holds.
fn churn(mode: AggregateMode, seed: u64) -> (Vec<(Key, Value)>, BTreeMap<Key, Value>) {
    let dir = TempDir::new().unwrap();
    let archive = Rc::new(LayeredArchive::create(dir.path().join("a"), options(mode)).unwrap());
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut expected = BTreeMap::new();
    for round in 0..6 {
        let mut mapping =
            SessionMapping::open(Rc::clone(&archive), &format!("s{round}"), false).unwrap();
        for _ in 0..150 {
            let k = key(rng.u32(0..500));
            if rng.u8(0..5) == 0 {
                mapping.delete(k.clone()).unwrap();
                expected.remove(&k);
            } else {
                let v = Value::Int(i64::from(rng.u32(..)));
                mapping.put(k.clone(), v.clone()).unwrap();
                expected.insert(k, v);
            }
        }
        mapping.store(false).unwrap();
        if round % 2 == 1 {
            assert!(archive.aggregate(true).unwrap().locked);
        }
        if round == 3 {
            assert!(archive.move_to_base(true).unwrap().locked);
        }
    }
    archive.aggregate(true).unwrap();
    archive.clean_up(true).unwrap();

    let reader = SessionMapping::open(Rc::clone(&archive), "reader", true).unwrap();
    let low = key(0);
    let high = key(99_999);
    let seen = reader.range_pairs(&low, &high, None).unwrap();
    (seen, expected)
}

#[test]
fn scatter_aggregation_matches_the_model() {
    for seed in [1, 2, 3] {
        let (seen, expected) = churn(AggregateMode::Scatter, seed);
        let expected: Vec<(Key, Value)> = expected.into_iter().collect();
        assert_eq!(seen, expected, "seed {seed}");
    }
}

#[test]
fn in_memory_and_scatter_agree() {
    let (in_memory, _) = churn(AggregateMode::InMemory, 9);
    let (scattered, _) = churn(AggregateMode::Scatter, 9);
    assert_eq!(in_memory, scattered);
}

#[test]
fn merged_trees_prefer_newer_values() {
    let dir = TempDir::new().unwrap();
    let older_pairs: Vec<(Key, Value)> = (0..400).map(|n| (key(n), Value::Int(0))).collect();
    let newer_pairs: Vec<(Key, Value)> = (0..400)
        .step_by(3)
        .map(|n| {
            let value = if n % 2 == 0 { Value::Tombstone } else { Value::Int(1) };
            (key(n), value)
        })
        .collect();
    let opts = small_tree();
    let older = SortedTree::create(
        &dir.path().join("older.ktree"),
        stream::from_sorted_pairs(older_pairs, opts.node_bytes),
        &opts,
    )
    .unwrap();
    let newer = SortedTree::create(
        &dir.path().join("newer.ktree"),
        stream::from_sorted_pairs(newer_pairs, opts.node_bytes),
        &opts,
    )
    .unwrap();
    assert!(older.height() > 1);

    let merged = merge_trees(&older, &newer, &dir.path().join("merged.ktree"), true, &opts).unwrap();
    let pairs = collect_pairs(merged.leaf_frames(None, true).unwrap()).unwrap();
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    assert!(pairs.iter().all(|(_, v)| !v.is_tombstone()));
    assert_eq!(merged.get(&key(3)).unwrap(), Some(Value::Int(1)));
    assert_eq!(merged.get(&key(6)).unwrap(), None);
    assert_eq!(merged.get(&key(7)).unwrap(), Some(Value::Int(0)));

    let reopened = SortedTree::open(merged.path(), &opts).unwrap();
    assert_eq!(reopened.scan().unwrap(), pairs);
}
