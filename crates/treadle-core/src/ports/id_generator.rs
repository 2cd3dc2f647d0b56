//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + 乱数で ULID を生成

use crate::domain::ids::{FireInstanceId, JobId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散環境で衝突しない ID を生成
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;

    fn generate_fire_instance_id(&self) -> FireInstanceId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡すとタイムスタンプ部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next_ulid())
    }

    fn generate_fire_instance_id(&self) -> FireInstanceId {
        FireInstanceId::from(self.next_ulid())
    }
}
