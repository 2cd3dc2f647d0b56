//! App - アプリケーション層
//!
//! dao と cluster を組み合わせて JobStore の操作を実装します。
//!
//! # 主要コンポーネント
//! - **JobStoreBuilder**: 構築とワイヤリング（Fail-fast）
//! - **JobStore**: ホストのスケジューラ向けの入口
//! - **Acquirer**: 次に発火するトリガーの取得
//! - **FireCycle**: 発火と完了
//! - **StateManager**: pause / resume
//! - **MisfirePolicy**: 発火遅れの補正
//! - **Persister**: ジョブ・トリガー・カレンダーの保存と削除（孤児ジョブの連鎖削除）

pub mod acquirer;
pub mod builder;
pub mod fire_cycle;
pub mod job_store;
pub mod misfire;
pub mod persister;
pub mod state_manager;

#[cfg(test)]
pub(crate) mod fixture;

// 主要な型を再エクスポート
pub use self::acquirer::Acquirer;
pub use self::builder::{BuildError, JobStoreBuilder};
pub use self::fire_cycle::{FireCycle, TriggerFiredBundle, TriggerFiredResult};
pub use self::job_store::JobStore;
pub use self::misfire::MisfirePolicy;
pub use self::persister::Persister;
pub use self::state_manager::StateManager;
