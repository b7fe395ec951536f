// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Integration tests for the operation store

use chrono::{TimeZone, Utc};
use opscope_core::OperationRecord;
use opscope_storage::{
    ChangeKind, IndexField, OperationSink, OperationStore, StoreConfig, LOG_FILE_NAME,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::TempDir;

fn record(id: &str, secs: i64) -> OperationRecord {
    let mut record = OperationRecord::new(id, Utc.timestamp_opt(secs, 0).unwrap());
    record.method = "GET".to_string();
    record
}

/// Test that upserting the same id twice leaves the second payload
#[test]
fn test_upsert_idempotence() {
    let store = OperationStore::in_memory();
    let mut first = record("op-1", 10);
    first.path = "/first".to_string();
    let mut second = record("op-1", 20);
    second.path = "/second".to_string();
    second.status_code = Some(201);

    store.upsert(first).unwrap();
    store.upsert(second.clone()).unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(store.get("op-1"), Some(second));
}

/// Test that a reopened store replays every logged mutation
#[test]
fn test_log_replay_restores_records() {
    let dir = TempDir::new().unwrap();
    {
        let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        store
            .bulk_upsert(&[record("a", 1), record("b", 2), record("c", 3)])
            .unwrap();
        store.delete("b").unwrap();
        let mut replaced = record("a", 4);
        replaced.method = "PATCH".to_string();
        store.upsert(replaced).unwrap();
    }

    let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.len(), 2);
    assert!(store.get("b").is_none());
    assert_eq!(store.get("a").unwrap().method, "PATCH");
    assert_eq!(store.read().index_count(IndexField::Time), Some(2));
}

/// Test that a torn trailing frame is dropped and the file truncated
#[test]
fn test_torn_tail_truncated() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join(LOG_FILE_NAME);
    let good_len = {
        let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        store.upsert(record("a", 1)).unwrap();
        store.upsert(record("b", 2)).unwrap();
        store.stats().log_bytes
    };

    // Half a frame: a length prefix promising more bytes than follow
    let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
    file.write_all(&[200, 0, 0, 0, 1, 2, 3, 4, b'{', b'"']).unwrap();
    drop(file);

    let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), good_len);

    // The store keeps appending cleanly after truncation
    store.upsert(record("c", 3)).unwrap();
    drop(store);
    let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.len(), 3);
}

/// Test that prune keeps exactly the records stamped by the run
#[test]
fn test_resync_pruning() {
    let store = OperationStore::in_memory();
    store
        .bulk_upsert(&[record("old-1", 1), record("old-2", 2), record("kept", 3)])
        .unwrap();

    let stamped: Vec<_> = ["kept", "new-1", "new-2"]
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let mut r = record(id, 10 + i as i64);
            r.last_synced_at = Some("run-7".to_string());
            r
        })
        .collect();
    OperationSink::bulk_upsert(&store, &stamped).unwrap();

    let removed = OperationSink::prune_not_stamped(&store, "run-7").unwrap();
    assert_eq!(removed, 2);
    let mut ids: Vec<_> = store.read().records().map(|r| r.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["kept", "new-1", "new-2"]);
}

/// Test one notification per mutation, with increasing versions
#[test]
fn test_change_notifications() {
    let store = OperationStore::in_memory();
    let mut rx = store.subscribe();

    store.upsert(record("a", 1)).unwrap();
    store.bulk_upsert(&[record("b", 2), record("c", 3)]).unwrap();
    store.delete("a").unwrap();
    store.prune_not_stamped("nobody").unwrap();
    store.upsert(record("d", 4)).unwrap();
    store.clear().unwrap();

    let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    let versions: Vec<_> = kinds.iter().map(|c| c.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
        kinds.iter().map(|c| c.kind).collect::<Vec<_>>(),
        vec![
            ChangeKind::Upserted { count: 1 },
            ChangeKind::Upserted { count: 2 },
            ChangeKind::Deleted { count: 1 },
            ChangeKind::Pruned { removed: 2 },
            ChangeKind::Upserted { count: 1 },
            ChangeKind::Cleared,
        ]
    );
}

#[derive(Debug, Clone)]
enum Op {
    Upsert(u8, i64),
    Delete(u8),
    Prune,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..12, 0i64..1_000).prop_map(|(id, t)| Op::Upsert(id, t)),
        2 => (0u8..12).prop_map(Op::Delete),
        1 => Just(Op::Prune),
    ]
}

proptest! {
    /// Every index covers every record after any mutation sequence, and a
    /// replayed store matches the live one.
    #[test]
    fn prop_indexes_cover_table(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = TempDir::new().unwrap();
        let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        let mut model: HashMap<String, OperationRecord> = HashMap::new();

        for op in ops {
            match op {
                Op::Upsert(id, t) => {
                    let mut r = record(&format!("id-{}", id), t);
                    if id % 2 == 0 {
                        r.status_code = Some(200 + id as u16);
                        r.last_synced_at = Some("run".to_string());
                    }
                    model.insert(r.id.clone(), r.clone());
                    store.upsert(r).unwrap();
                }
                Op::Delete(id) => {
                    let key = format!("id-{}", id);
                    let existed = store.delete(&key).unwrap();
                    prop_assert_eq!(existed, model.remove(&key).is_some());
                }
                Op::Prune => {
                    let before = model.len();
                    model.retain(|_, r| r.last_synced_at.as_deref() == Some("run"));
                    let removed = store.prune_not_stamped("run").unwrap();
                    prop_assert_eq!(removed, before - model.len());
                }
            }
        }

        {
            let view = store.read();
            prop_assert_eq!(view.len(), model.len());
            for field in IndexField::ALL {
                prop_assert_eq!(view.index_count(field), Some(model.len()));
            }
        }
        drop(store);

        let reopened = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        prop_assert_eq!(reopened.len(), model.len());
        for (id, r) in &model {
            let got = reopened.get(id);
            prop_assert_eq!(got.as_ref(), Some(r));
        }
    }
}
