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

//! Operation Store
//!
//! Indexed table of [`OperationRecord`]s with an append-only log for
//! persistence and a broadcast channel for change notification.
//!
//! # Concurrency
//!
//! Writers take the table write lock and then the log mutex, append the
//! mutation to the log and only then apply it to the table. Readers take the
//! table read lock through [`OperationStore::read`], so one query observes
//! one consistent snapshot (records, indexes and counts together).

use crate::error::Result;
use crate::index::{IndexField, ScanOrder, SecondaryIndex};
use crate::log::{LogEntry, OperationLog};
use crate::schema::{self, CURRENT_SCHEMA_VERSION};
use opscope_core::OperationRecord;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "operations.log";

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// fsync after every appended frame
    #[serde(default)]
    pub sync_writes: bool,

    /// Capacity of the change notification channel
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
}

fn default_notify_capacity() -> usize {
    256
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_writes: false,
            notify_capacity: default_notify_capacity(),
        }
    }
}

/// What a mutation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    Upserted { count: usize },
    Deleted { count: usize },
    Cleared,
    Pruned { removed: usize },
}

/// Store-wide change notification, sent after every successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChange {
    /// Monotonic table version after the mutation
    pub version: u64,
    pub kind: ChangeKind,
}

/// Store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub record_count: usize,
    pub schema_version: u32,
    pub log_bytes: u64,
    pub version: u64,
    pub persistent: bool,
}

/// Write capability used by ingestion.
pub trait OperationSink: Send + Sync {
    fn upsert(&self, record: OperationRecord) -> Result<()>;
    fn bulk_upsert(&self, records: &[OperationRecord]) -> Result<()>;
    fn prune_not_stamped(&self, run_id: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
struct Table {
    records: BTreeMap<String, OperationRecord>,
    indexes: BTreeMap<IndexField, SecondaryIndex>,
    version: u64,
}

impl Table {
    fn with_indexes(fields: &[IndexField]) -> Self {
        let mut table = Self::default();
        for field in fields {
            table.indexes.insert(*field, SecondaryIndex::default());
        }
        table
    }

    /// Build (or rebuild) the given indexes from the current records.
    fn add_indexes(&mut self, fields: &[IndexField]) {
        for field in fields {
            let mut index = SecondaryIndex::default();
            for (id, record) in &self.records {
                index.insert(field.extract(record), id);
            }
            self.indexes.insert(*field, index);
        }
    }

    fn insert(&mut self, record: OperationRecord) {
        self.remove(&record.id);
        for (field, index) in self.indexes.iter_mut() {
            index.insert(field.extract(&record), &record.id);
        }
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &str) -> Option<OperationRecord> {
        let old = self.records.remove(id)?;
        for (field, index) in self.indexes.iter_mut() {
            index.remove(field.extract(&old), id);
        }
        Some(old)
    }

    fn clear(&mut self) {
        self.records.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
    }

    fn apply(&mut self, entry: LogEntry<'_>) {
        match entry {
            LogEntry::Put { records } => {
                for record in records.into_owned() {
                    self.insert(record);
                }
            }
            LogEntry::Delete { ids } => {
                for id in ids.iter() {
                    self.remove(id);
                }
            }
        }
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Read view over one consistent snapshot of the table.
pub struct TableView<'a> {
    table: RwLockReadGuard<'a, Table>,
}

impl<'a> TableView<'a> {
    pub fn len(&self) -> usize {
        self.table.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.records.is_empty()
    }

    /// Table version this view observes.
    pub fn version(&self) -> u64 {
        self.table.version
    }

    pub fn get(&self, id: &str) -> Option<&OperationRecord> {
        self.table.records.get(id)
    }

    /// All records in primary key order.
    pub fn records(&self) -> impl Iterator<Item = &OperationRecord> + '_ {
        self.table.records.values()
    }

    /// Records in primary key order, either direction.
    pub fn scan_by_id(&self, order: ScanOrder) -> Box<dyn Iterator<Item = &OperationRecord> + '_> {
        let records = self.table.records.values();
        match order {
            ScanOrder::Asc => Box::new(records),
            ScanOrder::Desc => Box::new(records.rev()),
        }
    }

    /// Records in `field` index order, ties broken by id in the same
    /// direction. `None` if the field has no index.
    pub fn index_scan(
        &self,
        field: IndexField,
        order: ScanOrder,
    ) -> Option<Box<dyn Iterator<Item = &OperationRecord> + '_>> {
        let index = self.table.indexes.get(&field)?;
        let records = &self.table.records;
        Some(Box::new(
            index.ids(order).filter_map(move |id| records.get(id)),
        ))
    }

    /// Number of entries in `field`'s index.
    pub fn index_count(&self, field: IndexField) -> Option<usize> {
        self.table.indexes.get(&field).map(SecondaryIndex::len)
    }

    pub fn has_index(&self, field: IndexField) -> bool {
        self.table.indexes.contains_key(&field)
    }
}

/// Embedded operation store.
pub struct OperationStore {
    table: RwLock<Table>,
    log: Option<Mutex<OperationLog>>,
    changes: broadcast::Sender<StoreChange>,
    config: StoreConfig,
}

impl OperationStore {
    /// Open (or create) a persistent store in `dir`, replaying its log and
    /// applying any pending schema migrations.
    pub fn open<P: AsRef<Path>>(dir: P, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let (mut log, replay) = OperationLog::open(&path, config.sync_writes)?;
        let mut table = Table::with_indexes(&schema::indexes_for(replay.version));
        for entry in replay.entries {
            table.apply(entry);
        }

        if replay.version < CURRENT_SCHEMA_VERSION {
            for migration in schema::pending(replay.version) {
                info!(
                    version = migration.version,
                    description = migration.description,
                    new_indexes = migration.adds_indexes.len(),
                    "Applying schema migration"
                );
                table.add_indexes(migration.adds_indexes);
            }
            log = OperationLog::create(
                &path,
                CURRENT_SCHEMA_VERSION,
                table.records.values(),
                config.sync_writes,
            )?;
            info!(
                from = replay.version,
                to = CURRENT_SCHEMA_VERSION,
                records = table.records.len(),
                "Upgraded operation store"
            );
        }

        info!(
            path = %log.path().display(),
            records = table.records.len(),
            "Opened operation store"
        );

        let (changes, _) = broadcast::channel(config.notify_capacity.max(1));
        Ok(Self {
            table: RwLock::new(table),
            log: Some(Mutex::new(log)),
            changes,
            config,
        })
    }

    /// Store without persistence.
    pub fn in_memory() -> Self {
        let config = StoreConfig::default();
        let (changes, _) = broadcast::channel(config.notify_capacity);
        Self {
            table: RwLock::new(Table::with_indexes(&schema::indexes_for(
                CURRENT_SCHEMA_VERSION,
            ))),
            log: None,
            changes,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Take a consistent read view.
    pub fn read(&self) -> TableView<'_> {
        TableView {
            table: self.table.read(),
        }
    }

    /// Insert or replace one record.
    pub fn upsert(&self, record: OperationRecord) -> Result<()> {
        self.bulk_upsert(std::slice::from_ref(&record))
    }

    /// Insert or replace many records as one log frame.
    pub fn bulk_upsert(&self, records: &[OperationRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut table = self.table.write();
        self.append(&LogEntry::Put {
            records: Cow::Borrowed(records),
        })?;
        for record in records {
            table.insert(record.clone());
        }
        let version = table.bump();
        drop(table);

        debug!(count = records.len(), version, "Upserted operations");
        self.notify(version, ChangeKind::Upserted {
            count: records.len(),
        });
        Ok(())
    }

    /// Delete one record. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.delete_many(&[id.to_string()])? == 1)
    }

    /// Delete many records atomically. Returns how many existed.
    pub fn delete_many(&self, ids: &[String]) -> Result<usize> {
        let mut table = self.table.write();
        let mut seen = HashSet::new();
        let present: Vec<String> = ids
            .iter()
            .filter(|id| table.records.contains_key(id.as_str()))
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(0);
        }

        self.append(&LogEntry::Delete {
            ids: Cow::Borrowed(&present),
        })?;
        for id in &present {
            table.remove(id);
        }
        let version = table.bump();
        drop(table);

        debug!(count = present.len(), version, "Deleted operations");
        self.notify(version, ChangeKind::Deleted {
            count: present.len(),
        });
        Ok(present.len())
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<()> {
        let mut table = self.table.write();
        if table.records.is_empty() {
            return Ok(());
        }

        if let Some(log) = &self.log {
            let mut log = log.lock();
            let path = log.path().to_path_buf();
            *log = OperationLog::create(
                &path,
                CURRENT_SCHEMA_VERSION,
                std::iter::empty(),
                self.config.sync_writes,
            )?;
        }
        let removed = table.records.len();
        table.clear();
        let version = table.bump();
        drop(table);

        info!(removed, version, "Cleared operation store");
        self.notify(version, ChangeKind::Cleared);
        Ok(())
    }

    /// Delete every record not stamped with `run_id`.
    pub fn prune_not_stamped(&self, run_id: &str) -> Result<usize> {
        let mut table = self.table.write();
        let stale: Vec<String> = table
            .records
            .values()
            .filter(|r| r.last_synced_at.as_deref() != Some(run_id))
            .map(|r| r.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        self.append(&LogEntry::Delete {
            ids: Cow::Borrowed(&stale),
        })?;
        for id in &stale {
            table.remove(id);
        }
        let version = table.bump();
        drop(table);

        info!(run_id, removed = stale.len(), version, "Pruned unstamped operations");
        self.notify(version, ChangeKind::Pruned {
            removed: stale.len(),
        });
        Ok(stale.len())
    }

    pub fn get(&self, id: &str) -> Option<OperationRecord> {
        self.table.read().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().records.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let table = self.table.read();
        StoreStats {
            record_count: table.records.len(),
            schema_version: CURRENT_SCHEMA_VERSION,
            log_bytes: self.log.as_ref().map(|l| l.lock().size()).unwrap_or(0),
            version: table.version,
            persistent: self.log.is_some(),
        }
    }

    /// Rewrite the log with live records only.
    pub fn compact(&self) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let table = self.table.write();
        let mut log = log.lock();
        let before = log.size();
        let path = log.path().to_path_buf();
        *log = OperationLog::create(
            &path,
            CURRENT_SCHEMA_VERSION,
            table.records.values(),
            self.config.sync_writes,
        )?;
        info!(before, after = log.size(), records = table.records.len(), "Compacted operation log");
        Ok(())
    }

    fn append(&self, entry: &LogEntry<'_>) -> Result<()> {
        if let Some(log) = &self.log {
            log.lock().append(entry)?;
        }
        Ok(())
    }

    fn notify(&self, version: u64, kind: ChangeKind) {
        // No receivers is fine
        let _ = self.changes.send(StoreChange { version, kind });
    }
}

impl OperationSink for OperationStore {
    fn upsert(&self, record: OperationRecord) -> Result<()> {
        OperationStore::upsert(self, record)
    }

    fn bulk_upsert(&self, records: &[OperationRecord]) -> Result<()> {
        OperationStore::bulk_upsert(self, records)
    }

    fn prune_not_stamped(&self, run_id: &str) -> Result<usize> {
        OperationStore::prune_not_stamped(self, run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::write_raw_log;
    use crate::StoreError;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(id: &str, secs: i64) -> OperationRecord {
        OperationRecord::new(id, Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn test_upsert_replaces_and_reindexes() {
        let store = OperationStore::in_memory();
        let mut first = record("a", 1);
        first.method = "GET".into();
        store.upsert(first).unwrap();

        let mut second = record("a", 2);
        second.method = "POST".into();
        store.upsert(second.clone()).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a"), Some(second));

        let view = store.read();
        for field in IndexField::ALL {
            assert_eq!(view.index_count(field), Some(1), "{:?}", field);
        }
        let methods: Vec<_> = view
            .index_scan(IndexField::Method, ScanOrder::Asc)
            .unwrap()
            .map(|r| r.method.clone())
            .collect();
        assert_eq!(methods, vec!["POST"]);
    }

    #[test]
    fn test_index_scan_orders_nulls_first() {
        let store = OperationStore::in_memory();
        let mut with_status = record("a", 1);
        with_status.status_code = Some(500);
        let mut low_status = record("b", 2);
        low_status.status_code = Some(200);
        store
            .bulk_upsert(&[with_status, low_status, record("c", 3)])
            .unwrap();

        let view = store.read();
        let asc: Vec<_> = view
            .index_scan(IndexField::StatusCode, ScanOrder::Asc)
            .unwrap()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(asc, vec!["c", "b", "a"]);
        let desc: Vec<_> = view
            .index_scan(IndexField::StatusCode, ScanOrder::Desc)
            .unwrap()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(desc, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_noop_mutations_do_not_notify() {
        let store = OperationStore::in_memory();
        let mut rx = store.subscribe();

        assert!(!store.delete("missing").unwrap());
        assert_eq!(store.prune_not_stamped("run").unwrap(), 0);
        store.clear().unwrap();
        store.bulk_upsert(&[]).unwrap();
        assert!(rx.try_recv().is_err());

        store.upsert(record("a", 1)).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Upserted { count: 1 });
        assert_eq!(change.version, 1);
    }

    #[test]
    fn test_delete_many_counts_present_ids_once() {
        let store = OperationStore::in_memory();
        store
            .bulk_upsert(&[record("a", 1), record("b", 2), record("c", 3)])
            .unwrap();
        let removed = store
            .delete_many(&["a".into(), "a".into(), "zz".into(), "c".into()])
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.read().index_count(IndexField::Time), Some(1));
    }

    #[test]
    fn test_upgrade_from_v1_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        write_raw_log(
            &path,
            1,
            &[
                r#"{"op":"put","records":[{"id":"a","time":"2024-01-01T00:00:00Z","method":"GET","path":"/x","duration":4.0,"status_code":200}]}"#,
                r#"{"op":"put","records":[{"id":"b","time":"2024-01-02T00:00:00Z","method":"POST"}]}"#,
            ],
        )
        .unwrap();

        let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.len(), 2);
        let a = store.get("a").unwrap();
        assert_eq!(a.status_code, Some(200));
        assert!(a.operation_id.is_none());
        assert!(a.mcp_tool.is_none());
        assert!(a.last_synced_at.is_none());

        let view = store.read();
        for field in IndexField::ALL {
            assert_eq!(view.index_count(field), Some(2), "{:?}", field);
        }
        drop(view);
        drop(store);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"OPSL");
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 4);

        let reopened = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = TempDir::new().unwrap();
        write_raw_log(&dir.path().join(LOG_FILE_NAME), 99, &[]).unwrap();
        let result = OperationStore::open(dir.path(), StoreConfig::default());
        assert!(matches!(
            result,
            Err(StoreError::SchemaTooNew { found: 99, .. })
        ));
    }

    #[test]
    fn test_clear_and_compact_shrink_log() {
        let dir = TempDir::new().unwrap();
        let store = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        for i in 0..20 {
            store.upsert(record("same", i)).unwrap();
        }
        let before = store.stats().log_bytes;
        store.compact().unwrap();
        let after = store.stats().log_bytes;
        assert!(after < before);
        assert_eq!(store.len(), 1);

        store.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.stats().log_bytes, 8);
        drop(store);

        let reopened = OperationStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert!(reopened.is_empty());
    }
}
