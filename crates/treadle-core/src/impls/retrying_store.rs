//! RetryingStore - 接続エラー時に 1 回だけ再接続してリトライする Store ラッパー
//!
//! 接続エラー以外（条件不一致など）はそのまま返します。2 回目も失敗した場合は
//! 呼び出し元に表面化します。

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::domain::StoreError;
use crate::ports::{Precondition, Row, Store, Table};

pub struct RetryingStore<S> {
    inner: S,
}

impl<S: Store> RetryingStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn with_reconnect<T, F, Fut>(&self, operation: &'static str, table: Table, attempt: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match attempt().await {
            Err(error) if error.is_connectivity() => {
                warn!(operation, table = table.name(), %error, "store call failed, reconnecting once");
                self.inner.reconnect().await?;
                attempt().await
            }
            result => result,
        }
    }
}

#[async_trait]
impl<S: Store> Store for RetryingStore<S> {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Row>, StoreError> {
        self.with_reconnect("get", table, || self.inner.get(table, key)).await
    }

    async fn scan(
        &self,
        table: Table,
        filter: &(dyn for<'r> Fn(&'r Row) -> bool + Send + Sync),
    ) -> Result<Vec<Row>, StoreError> {
        self.with_reconnect("scan", table, || self.inner.scan(table, filter)).await
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<u64, StoreError> {
        self.with_reconnect("put", table, || self.inner.put(table, key, value.clone()))
            .await
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected: Precondition,
        value: Value,
    ) -> Result<bool, StoreError> {
        self.with_reconnect("compare_and_set", table, || {
            self.inner.compare_and_set(table, key, expected, value.clone())
        })
        .await
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        self.with_reconnect("delete", table, || self.inner.delete(table, key)).await
    }

    async fn compare_and_delete(&self, table: Table, key: &str, version: u64) -> Result<bool, StoreError> {
        self.with_reconnect("compare_and_delete", table, || {
            self.inner.compare_and_delete(table, key, version)
        })
        .await
    }

    async fn truncate(&self, table: Table) -> Result<(), StoreError> {
        self.with_reconnect("truncate", table, || self.inner.truncate(table)).await
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.inner.reconnect().await
    }
}
