//! Typed - 型付きの行とジョブ型
//!
//! # 二層構造
//! - **Record**: テーブルと行キーを型に対応付け、RowCodec で serde_json 行に変換
//! - **JobKind / JobTypeRegistry**: ジョブ型タグを起動時に登録し、実行時に解決

pub mod codec;
pub mod record;
pub mod registry;

pub use self::codec::{decode, decode_all, decode_versioned, encode};
pub use self::record::{CalendarRecord, Record};
pub use self::registry::{JobKind, JobTypeDescriptor, JobTypeRegistry, RegistryError};

#[cfg(test)]
pub(crate) use self::registry::test_kinds;
