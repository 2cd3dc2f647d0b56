//! Store port - 行ストアの抽象化
//!
//! 複製されたテーブルストアへのインターフェースです。行単位の条件付き書き込み
//! （compare-and-set）だけを提供し、複数行にまたがるトランザクションはありません。
//!
//! # 設計原則
//! - ストアのハンドルは各コンポーネントのコンストラクタに注入する（グローバル接続なし）
//! - 読み取り→条件付き書き込みの手順は `dao::cas::update_record` に集約する
//! - バージョン付き行なので、楽観的排他制御を持つ別のストアに差し替えられる

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::StoreError;

/// Logical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Jobs,
    Triggers,
    Locks,
    Schedulers,
    PausedJobGroups,
    PausedTriggerGroups,
    Calendars,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Jobs => "jobs",
            Table::Triggers => "triggers",
            Table::Locks => "locks",
            Table::Schedulers => "schedulers",
            Table::PausedJobGroups => "paused_job_groups",
            Table::PausedTriggerGroups => "paused_trigger_groups",
            Table::Calendars => "calendars",
        }
    }
}

/// A stored row. `version` changes on every write.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    pub version: u64,
    pub value: Value,
}

/// Condition a conditional write is applied under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No row exists for the key.
    Absent,
    /// The row exists with exactly this version.
    Version(u64),
}

/// Store は全ノードから到達可能なテーブルストア
///
/// 条件付き書き込みが適用されなかった場合は `Ok(false)` を返します（エラーではない）。
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Row>, StoreError>;

    /// Rows of `table` accepted by `filter`, in key order.
    async fn scan(
        &self,
        table: Table,
        filter: &(dyn for<'r> Fn(&'r Row) -> bool + Send + Sync),
    ) -> Result<Vec<Row>, StoreError>;

    /// Unconditional upsert; returns the new version.
    async fn put(&self, table: Table, key: &str, value: Value) -> Result<u64, StoreError>;

    async fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected: Precondition,
        value: Value,
    ) -> Result<bool, StoreError>;

    /// Unconditional delete; returns whether a row was removed.
    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError>;

    async fn compare_and_delete(&self, table: Table, key: &str, version: u64) -> Result<bool, StoreError>;

    async fn truncate(&self, table: Table) -> Result<(), StoreError>;

    /// Re-establishes the session after a connectivity failure.
    async fn reconnect(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Row>, StoreError> {
        (**self).get(table, key).await
    }

    async fn scan(
        &self,
        table: Table,
        filter: &(dyn for<'r> Fn(&'r Row) -> bool + Send + Sync),
    ) -> Result<Vec<Row>, StoreError> {
        (**self).scan(table, filter).await
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<u64, StoreError> {
        (**self).put(table, key, value).await
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected: Precondition,
        value: Value,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_set(table, key, expected, value).await
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        (**self).delete(table, key).await
    }

    async fn compare_and_delete(&self, table: Table, key: &str, version: u64) -> Result<bool, StoreError> {
        (**self).compare_and_delete(table, key, version).await
    }

    async fn truncate(&self, table: Table) -> Result<(), StoreError> {
        (**self).truncate(table).await
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        (**self).reconnect().await
    }
}

/// Filter accepting every row.
pub fn all_rows(_: &Row) -> bool {
    true
}
