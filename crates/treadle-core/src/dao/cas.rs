//! Typed row access and the conditional update primitive.
//!
//! 読み取り→条件付き書き込みの手順はすべてこのモジュールを通します。
//! ストアを差し替えても呼び出し側のコードは変わりません。

use serde_json::Value;
use tracing::debug;

use crate::domain::PersistenceError;
use crate::ports::{Precondition, Row, Store};
use crate::typed::{Record, decode, decode_all, decode_versioned, encode};

/// Result of `update_record`.
#[derive(Debug)]
pub enum CasOutcome<R> {
    /// The mutation was written; holds the new record.
    Applied(R),
    /// The mutation declined to change the record.
    Rejected(R),
    /// No row for the key.
    Missing,
    /// Another writer changed the row between read and write.
    Conflict,
}

impl<R> CasOutcome<R> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Reads the row, applies `mutate` and writes it back only if the row version
/// is unchanged. `mutate` returns false to leave the row alone.
pub async fn update_record<R, F>(store: &dyn Store, key: &str, mutate: F) -> Result<CasOutcome<R>, PersistenceError>
where
    R: Record,
    F: FnOnce(&mut R) -> bool + Send,
{
    let Some(row) = store.get(R::TABLE, key).await? else {
        return Ok(CasOutcome::Missing);
    };
    let mut record: R = decode(&row)?;
    if !mutate(&mut record) {
        return Ok(CasOutcome::Rejected(record));
    }
    let applied = store
        .compare_and_set(R::TABLE, key, Precondition::Version(row.version), encode(&record)?)
        .await?;
    if applied {
        Ok(CasOutcome::Applied(record))
    } else {
        debug!(table = R::TABLE.name(), key, "conditional update lost the race");
        Ok(CasOutcome::Conflict)
    }
}

/// Insert-if-absent. Returns false when the row already exists.
pub async fn insert_record<R: Record>(store: &dyn Store, record: &R) -> Result<bool, PersistenceError> {
    let applied = store
        .compare_and_set(R::TABLE, &record.storage_key(), Precondition::Absent, encode(record)?)
        .await?;
    Ok(applied)
}

/// Overwrites the row only if it is still at `version`.
pub async fn replace_record<R: Record>(store: &dyn Store, record: &R, version: u64) -> Result<bool, PersistenceError> {
    let applied = store
        .compare_and_set(R::TABLE, &record.storage_key(), Precondition::Version(version), encode(record)?)
        .await?;
    Ok(applied)
}

pub async fn put_record<R: Record>(store: &dyn Store, record: &R) -> Result<u64, PersistenceError> {
    Ok(store.put(R::TABLE, &record.storage_key(), encode(record)?).await?)
}

pub async fn get_record<R: Record>(store: &dyn Store, key: &str) -> Result<Option<R>, PersistenceError> {
    Ok(get_versioned::<R>(store, key).await?.map(|(record, _)| record))
}

pub async fn get_versioned<R: Record>(store: &dyn Store, key: &str) -> Result<Option<(R, u64)>, PersistenceError> {
    match store.get(R::TABLE, key).await? {
        Some(row) => Ok(Some((decode(&row)?, row.version))),
        None => Ok(None),
    }
}

/// Decoded rows accepted by `filter`; malformed rows are skipped.
pub async fn scan_records<R: Record>(
    store: &dyn Store,
    filter: &(dyn for<'r> Fn(&'r Row) -> bool + Send + Sync),
) -> Result<Vec<R>, PersistenceError> {
    let rows = store.scan(R::TABLE, filter).await?;
    Ok(decode_all(&rows))
}

pub async fn scan_versioned<R: Record>(
    store: &dyn Store,
    filter: &(dyn for<'r> Fn(&'r Row) -> bool + Send + Sync),
) -> Result<Vec<(R, u64)>, PersistenceError> {
    let rows = store.scan(R::TABLE, filter).await?;
    Ok(decode_versioned(&rows))
}

/// `row.value.key.group` of job and trigger rows.
pub(crate) fn key_group(row: &Row) -> Option<&str> {
    row.value.get("key")?.get("group")?.as_str()
}

/// String field of a row, for raw-row filters.
pub(crate) fn str_field<'a>(row: &'a Row, field: &str) -> Option<&'a str> {
    row.value.get(field).and_then(Value::as_str)
}
