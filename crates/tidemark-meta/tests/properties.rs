//! Property-based tests for the meta state machine and store.

mod common;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::test_config;
use tidemark_meta::types::{decode, encode};
use tidemark_meta::{
    Command, CommandLog, KvStore, LogIndex, MemoryKvStore, MetaData, MetaError, MetaStore,
    RetentionPolicyInfo,
};

#[derive(Clone, Debug)]
enum DbOp {
    Create(String),
    Drop(String),
}

fn db_op() -> impl Strategy<Value = DbOp> {
    let name = prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(String::from);
    prop_oneof![
        name.clone().prop_map(DbOp::Create),
        name.prop_map(DbOp::Drop),
    ]
}

fn command(op: &DbOp) -> Command {
    match op {
        DbOp::Create(name) => Command::CreateDatabase {
            name: name.clone(),
            default_policy: Some(RetentionPolicyInfo::new("default")),
        },
        DbOp::Drop(name) => Command::DropDatabase { name: name.clone() },
    }
}

/// Applies `ops` to a set, returning the expected outcome of each.
fn model(ops: &[DbOp]) -> (BTreeSet<String>, Vec<Result<(), MetaError>>) {
    let mut set = BTreeSet::new();
    let mut results = Vec::new();
    for op in ops {
        results.push(match op {
            DbOp::Create(name) if !set.insert(name.clone()) => Err(MetaError::DatabaseExists),
            DbOp::Drop(name) if !set.remove(name) => Err(MetaError::DatabaseNotFound(name.clone())),
            _ => Ok(()),
        });
    }
    (set, results)
}

fn apply_all(ops: &[DbOp]) -> (MetaData, Vec<Result<(), MetaError>>) {
    let mut data = MetaData::new();
    let results = ops
        .iter()
        .enumerate()
        .map(|(i, op)| data.apply(LogIndex::new(i as u64 + 1), &command(op)).map(|_| ()))
        .collect();
    (data, results)
}

fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    // Year 1 through year 3000, in whole seconds.
    (-62_135_596_800i64..32_503_680_000i64).prop_map(|secs| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    })
}

proptest! {
    #[test]
    fn prop_database_set_matches_model(ops in prop::collection::vec(db_op(), 0..40)) {
        let (expected, expected_results) = model(&ops);
        let (data, results) = apply_all(&ops);

        prop_assert_eq!(results, expected_results);
        prop_assert_eq!(data.database_names(), expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_redelivered_entries_are_ignored(ops in prop::collection::vec(db_op(), 1..20)) {
        let (mut data, _) = apply_all(&ops);
        let before = data.clone();
        for (i, op) in ops.iter().enumerate() {
            let _ = data.apply(LogIndex::new(i as u64 + 1), &command(op));
        }
        prop_assert_eq!(data, before);
    }

    #[test]
    fn prop_snapshot_roundtrip(ops in prop::collection::vec(db_op(), 0..30)) {
        let (data, _) = apply_all(&ops);
        let bytes = encode(&data).unwrap();
        let back: MetaData = decode(&bytes).unwrap();
        prop_assert_eq!(back, data);
    }

    #[test]
    fn prop_shard_group_covers_timestamp(ts in timestamp(), hours in 1u64..200) {
        let mut data = MetaData::new();
        let width = Duration::from_secs(hours * 3_600);
        let commands = [
            Command::CreateNode { url: "http://node0:8086".into() },
            Command::CreateDatabase { name: "db".into(), default_policy: None },
            Command::CreateRetentionPolicy {
                database: "db".into(),
                policy: RetentionPolicyInfo {
                    shard_group_duration: width,
                    ..RetentionPolicyInfo::new("rp")
                },
            },
            Command::CreateShardGroupIfNotExists {
                database: "db".into(),
                policy: "rp".into(),
                timestamp: ts,
            },
        ];
        for (i, cmd) in commands.iter().enumerate() {
            data.apply(LogIndex::new(i as u64 + 1), cmd).unwrap();
        }

        let rp = data.retention_policy("db", "rp").unwrap().unwrap();
        prop_assert_eq!(rp.shard_groups.len(), 1);
        let group = &rp.shard_groups[0];
        prop_assert!(group.contains(ts));
        prop_assert_eq!((group.end_time - group.start_time).num_seconds() as u64, width.as_secs());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_store_survives_restart(ops in prop::collection::vec(db_op(), 0..16)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (expected, _) = model(&ops);
            let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
            let config = tidemark_meta::MetaConfig {
                snapshot_interval: 4,
                ..test_config()
            };

            let open = |kv: Arc<dyn KvStore>| {
                let log = CommandLog::open(kv.clone(), &config.command_log).unwrap();
                let store = MetaStore::new(config.clone(), Arc::new(log), kv);
                store.open().unwrap();
                store
            };

            let store = open(kv.clone());
            for op in &ops {
                let _ = match op {
                    DbOp::Create(name) => store.create_database(name).await,
                    DbOp::Drop(name) => store.drop_database(name).await,
                };
            }
            let applied = store.applied_index();
            store.close().await.unwrap();

            let store = open(kv);
            store.sync(applied, Duration::from_secs(5)).await.unwrap();
            assert_eq!(store.databases(), expected.into_iter().collect::<Vec<_>>());
            assert_eq!(store.applied_index(), applied);
            store.close().await.unwrap();
        });
    }
}
