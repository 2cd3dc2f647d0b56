//! RowCodec - Record と行の相互変換
//!
//! serde_json の Value を行の表現として使います。デコードに失敗した行は
//! `PersistenceError::Corrupt`（データエラー）になり、スキャンではその行だけ飛ばします。

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::record::Record;
use crate::domain::PersistenceError;
use crate::ports::Row;

pub fn encode<R: Record>(record: &R) -> Result<Value, PersistenceError> {
    serde_json::to_value(record).map_err(|e| PersistenceError::Corrupt {
        table: R::TABLE.name(),
        key: record.storage_key(),
        reason: e.to_string(),
    })
}

pub fn decode<R: Record>(row: &Row) -> Result<R, PersistenceError> {
    <R as Deserialize>::deserialize(&row.value).map_err(|e| PersistenceError::Corrupt {
        table: R::TABLE.name(),
        key: row.key.clone(),
        reason: e.to_string(),
    })
}

/// Decodes every row, logging and dropping the malformed ones.
pub fn decode_all<R: Record>(rows: &[Row]) -> Vec<R> {
    rows.iter()
        .filter_map(|row| match decode::<R>(row) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(table = R::TABLE.name(), key = %row.key, %error, "skipping malformed row");
                None
            }
        })
        .collect()
}

/// Like `decode_all` but keeps each row's version.
pub fn decode_versioned<R: Record>(rows: &[Row]) -> Vec<(R, u64)> {
    rows.iter()
        .filter_map(|row| match decode::<R>(row) {
            Ok(record) => Some((record, row.version)),
            Err(error) => {
                warn!(table = R::TABLE.name(), key = %row.key, %error, "skipping malformed row");
                None
            }
        })
        .collect()
}
