//! treadle-core
//!
//! Cluster-safe persistent job store for a host scheduler.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（keys, lease, liveness, job, trigger, schedule, calendar, state, errors）
//! - **ports**: 抽象化レイヤー（Store, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStore, RetryingStore）
//! - **typed**: 型付きの行（Record, RowCodec）とジョブ型レジストリ（JobKind, JobTypeRegistry）
//! - **dao**: テーブルごとのアクセスと条件付き書き込み（update_record）
//! - **cluster**: ノード間の調停（LeaseLock, ExpiryPolicy, LivenessRegistry, Recoverer, CheckinLoop）
//! - **app**: JobStore の操作（JobStoreBuilder, JobStore, Acquirer, FireCycle, StateManager, Persister）
//! - **config**: StoreConfig

pub mod app;
pub mod cluster;
pub mod config;
pub mod dao;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use self::app::{BuildError, JobStore, JobStoreBuilder, TriggerFiredBundle, TriggerFiredResult};
pub use self::config::{MissingLivenessPolicy, StoreConfig};
pub use self::domain::PersistenceError;
