//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: 開発・テスト用の共有ストア（障害注入つき）
//! - **RetryingStore**: 接続エラー時に 1 回だけ再接続するラッパー
//!
//! 本番用のストア実装は別クレートに置く想定です。

pub mod inmem_store;
pub mod retrying_store;

pub use self::inmem_store::InMemoryStore;
pub use self::retrying_store::RetryingStore;
