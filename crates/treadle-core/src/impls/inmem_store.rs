//! In-memory store implementation.
//!
//! 1 プロセス内で複数ノードを模擬するためのストアです。各ノードが同じ
//! `Arc<InMemoryStore>` を共有し、条件付き書き込みの競合はここで解決されます。
//! テスト用に接続障害を注入できます。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::domain::StoreError;
use crate::ports::{Precondition, Row, Store, Table};

/// In-memory store state.
#[derive(Default)]
struct InMemoryStoreState {
    tables: HashMap<Table, BTreeMap<String, Row>>,

    /// Last version handed out; versions are unique across tables.
    last_version: u64,
}

impl InMemoryStoreState {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn table(&self, table: Table) -> Option<&BTreeMap<String, Row>> {
        self.tables.get(&table)
    }

    fn table_mut(&mut self, table: Table) -> &mut BTreeMap<String, Row> {
        self.tables.entry(table).or_default()
    }

    fn write(&mut self, table: Table, key: &str, value: Value) -> u64 {
        let version = self.next_version();
        self.table_mut(table).insert(
            key.to_string(),
            Row {
                key: key.to_string(),
                version,
                value,
            },
        );
        version
    }
}

/// In-memory store implementation.
#[derive(Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    offline: AtomicBool,
    failures_left: AtomicU32,
    reconnects: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next `count` calls, then recovers.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// How many times `reconnect` was called.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Number of rows in `table`.
    pub async fn row_count(&self, table: Table) -> usize {
        let state = self.state.lock().await;
        state.table(table).map_or(0, BTreeMap::len)
    }

    fn check_reachable(&self, operation: &str, table: Table) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{operation} {}", table.name())));
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(format!("{operation} {}", table.name())));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Row>, StoreError> {
        self.check_reachable("get", table)?;
        let state = self.state.lock().await;
        Ok(state.table(table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn scan(
        &self,
        table: Table,
        filter: &(dyn for<'r> Fn(&'r Row) -> bool + Send + Sync),
    ) -> Result<Vec<Row>, StoreError> {
        self.check_reachable("scan", table)?;
        let state = self.state.lock().await;
        Ok(state
            .table(table)
            .map(|rows| rows.values().filter(|row| filter(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<u64, StoreError> {
        self.check_reachable("put", table)?;
        let mut state = self.state.lock().await;
        Ok(state.write(table, key, value))
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected: Precondition,
        value: Value,
    ) -> Result<bool, StoreError> {
        self.check_reachable("compare_and_set", table)?;
        let mut state = self.state.lock().await;
        let current = state.table(table).and_then(|rows| rows.get(key)).map(|row| row.version);
        let matches = match (expected, current) {
            (Precondition::Absent, None) => true,
            (Precondition::Version(expected), Some(current)) => expected == current,
            _ => false,
        };
        if matches {
            state.write(table, key, value);
        }
        Ok(matches)
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        self.check_reachable("delete", table)?;
        let mut state = self.state.lock().await;
        Ok(state.table_mut(table).remove(key).is_some())
    }

    async fn compare_and_delete(&self, table: Table, key: &str, version: u64) -> Result<bool, StoreError> {
        self.check_reachable("compare_and_delete", table)?;
        let mut state = self.state.lock().await;
        let rows = state.table_mut(table);
        let matches = rows.get(key).is_some_and(|row| row.version == version);
        if matches {
            rows.remove(key);
        }
        Ok(matches)
    }

    async fn truncate(&self, table: Table) -> Result<(), StoreError> {
        self.check_reachable("truncate", table)?;
        let mut state = self.state.lock().await;
        state.tables.remove(&table);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reconnect".into()));
        }
        Ok(())
    }
}
