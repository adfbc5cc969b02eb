//! Catalog invariant tests: counter accuracy, shard shape, cascade delete,
//! snapshot round-trips, and replay determinism.

use proptest::prelude::*;
use std::collections::BTreeMap;

use tierstore::meta::types::{Command, ShardInfo, ShardType, Tier};
use tierstore::meta::MetadataFsm;

const DATA_SHARDS: usize = 6;
const TOTAL_SHARDS: usize = 9;

fn shard_list(bucket: &str, key: &str, size: u64) -> Vec<ShardInfo> {
    (0..TOTAL_SHARDS)
        .map(|i| ShardInfo {
            shard_id: format!("{}-{}-{}", bucket, key, i),
            node_id: format!("shard-{}", i % 3),
            node_addr: format!("http://shard-{}:8080", i % 3),
            shard_type: if i < DATA_SHARDS {
                ShardType::Data
            } else {
                ShardType::Parity
            },
            index: i,
            size: size.div_ceil(DATA_SHARDS as u64),
            checksum: format!("sum-{}", i),
        })
        .collect()
}

fn create_bucket(name: &str) -> Command {
    Command::CreateBucket {
        name: name.into(),
        owner: "alice".into(),
        acl: BTreeMap::new(),
        metadata: BTreeMap::new(),
    }
}

fn create_object(bucket: &str, key: &str, size: u64) -> Command {
    Command::CreateObject {
        bucket_name: bucket.into(),
        object_key: key.into(),
        size,
        tier: Tier::Hot,
        shards: shard_list(bucket, key, size),
        encryption_key_ref: "hkdf-v1:00:scope".into(),
        checksum: "checksum".into(),
        content_type: "application/octet-stream".into(),
        metadata: BTreeMap::new(),
    }
}

fn delete_object(bucket: &str, key: &str) -> Command {
    Command::DeleteObject {
        bucket_name: bucket.into(),
        object_key: key.into(),
    }
}

fn snapshot_bytes(fsm: &MetadataFsm) -> Vec<u8> {
    serde_json::to_vec(&fsm.snapshot()).unwrap()
}

/// Counters track object create/delete, and cascade delete empties the
/// bucket
#[test]
fn counters_and_cascade() {
    let mut fsm = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
    let mut clock = 1000u64;
    let mut apply = |fsm: &mut MetadataFsm, cmd: &Command| {
        clock += 1;
        fsm.apply(cmd, clock)
    };

    apply(&mut fsm, &create_bucket("b2")).unwrap();
    apply(&mut fsm, &create_object("b2", "a", 100)).unwrap();
    apply(&mut fsm, &create_object("b2", "b", 200)).unwrap();
    apply(&mut fsm, &create_object("b2", "c", 300)).unwrap();

    let bucket = fsm.get_bucket("b2").unwrap();
    assert_eq!(bucket.object_count, 3);
    assert_eq!(bucket.total_size, 600);

    apply(&mut fsm, &delete_object("b2", "b")).unwrap();
    let bucket = fsm.get_bucket("b2").unwrap();
    assert_eq!(bucket.object_count, 2);
    assert_eq!(bucket.total_size, 400);

    apply(&mut fsm, &Command::DeleteBucket { name: "b2".into() }).unwrap();
    assert!(fsm.get_bucket("b2").is_none());
    assert!(fsm.get_object("b2", "a").is_none());
    assert!(fsm.get_object("b2", "c").is_none());
    assert_eq!(fsm.object_count(), 0);
}

/// Every accepted object carries exactly k+m shards, indices 0..k+m-1,
/// data before parity
#[test]
fn shard_shape_enforced() {
    let mut fsm = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
    fsm.apply(&create_bucket("b1"), 1).unwrap();
    fsm.apply(&create_object("b1", "good", 64), 2).unwrap();

    let object = fsm.get_object("b1", "good").unwrap();
    assert_eq!(object.shards.len(), TOTAL_SHARDS);
    for (i, shard) in object.shards.iter().enumerate() {
        assert_eq!(shard.index, i);
        let expected = if i < DATA_SHARDS {
            ShardType::Data
        } else {
            ShardType::Parity
        };
        assert_eq!(shard.shard_type, expected);
    }
}

/// The same command log applied to two fresh FSMs yields byte-identical
/// snapshots
#[test]
fn replay_determinism() {
    let log: Vec<(Command, u64)> = vec![
        (create_bucket("b1"), 100),
        (create_bucket("b2"), 101),
        (create_object("b1", "x", 11), 102),
        (create_object("b2", "y", 345), 103),
        (
            Command::UpdateObject {
                bucket_name: "b1".into(),
                object_key: "x".into(),
                tier: Some(Tier::Cold),
                last_accessed: None,
                shards: None,
            },
            104,
        ),
        (
            Command::UpdateAccessTime {
                bucket_name: "b2".into(),
                object_key: "y".into(),
            },
            105,
        ),
        (delete_object("b1", "x"), 106),
    ];

    let mut a = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
    let mut b = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
    for (cmd, ts) in &log {
        let ra = a.apply(cmd, *ts);
        let rb = b.apply(cmd, *ts);
        assert_eq!(ra.is_ok(), rb.is_ok());
    }

    assert_eq!(snapshot_bytes(&a), snapshot_bytes(&b));
}

/// Restore(Snapshot(S)) == S for a state built from a mixed history
#[test]
fn snapshot_restore_identity() {
    let mut fsm = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
    fsm.apply(&create_bucket("b1"), 1).unwrap();
    fsm.apply(&create_bucket("b2"), 2).unwrap();
    for (i, key) in ["alpha", "beta", "gamma"].iter().enumerate() {
        fsm.apply(&create_object("b1", key, (i as u64 + 1) * 10), 3 + i as u64)
            .unwrap();
    }
    fsm.apply(&delete_object("b1", "beta"), 10).unwrap();

    let before = snapshot_bytes(&fsm);

    let mut restored = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
    restored.restore(serde_json::from_slice(&before).unwrap());

    assert_eq!(snapshot_bytes(&restored), before);
    assert_eq!(restored.get_bucket("b1").unwrap().object_count, 2);
    assert_eq!(restored.get_bucket("b1").unwrap().total_size, 40);
}

proptest! {
    /// After any interleaving of creates and deletes, bucket counters
    /// exactly match the surviving objects
    #[test]
    fn prop_counter_accuracy(ops in prop::collection::vec((0u8..3, 0usize..8, 1u64..10_000), 1..60)) {
        let mut fsm = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
        fsm.apply(&create_bucket("bkt"), 1).unwrap();

        let mut clock = 10u64;
        for (op, key_idx, size) in ops {
            clock += 1;
            let key = format!("k{}", key_idx);
            match op {
                0 | 1 => {
                    // Creates of existing keys are rejected and must not
                    // disturb the counters
                    let _ = fsm.apply(&create_object("bkt", &key, size), clock);
                }
                _ => {
                    let _ = fsm.apply(&delete_object("bkt", &key), clock);
                }
            }
        }

        let objects = fsm.list_objects("bkt", None, 1000);
        let expected_count = objects.len() as u64;
        let expected_size: u64 = objects.iter().map(|o| o.size).sum();

        let bucket = fsm.get_bucket("bkt").unwrap();
        prop_assert_eq!(bucket.object_count, expected_count);
        prop_assert_eq!(bucket.total_size, expected_size);
    }

    /// Cascade delete leaves no orphan objects, and the
    /// whole history replays deterministically
    #[test]
    fn prop_cascade_and_determinism(keys in prop::collection::btree_set("[a-z]{1,6}", 1..12)) {
        let mut log: Vec<(Command, u64)> = vec![
            (create_bucket("doomed"), 1),
            (create_bucket("kept"), 2),
        ];
        let mut clock = 10;
        for key in &keys {
            clock += 1;
            log.push((create_object("doomed", key, 100), clock));
            clock += 1;
            log.push((create_object("kept", key, 100), clock));
        }
        log.push((Command::DeleteBucket { name: "doomed".into() }, clock + 1));

        let mut a = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
        let mut b = MetadataFsm::new(DATA_SHARDS, TOTAL_SHARDS);
        for (cmd, ts) in &log {
            let _ = a.apply(cmd, *ts);
            let _ = b.apply(cmd, *ts);
        }

        prop_assert!(a.get_bucket("doomed").is_none());
        prop_assert_eq!(a.list_objects("doomed", None, 1000).len(), 0);
        prop_assert_eq!(a.list_objects("kept", None, 1000).len(), keys.len());
        prop_assert_eq!(snapshot_bytes(&a), snapshot_bytes(&b));
    }
}
