//! Record trait - 行として保存される型
//!
//! # 学習ポイント
//! - Associated Constants (`const TABLE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Calendar, JobRecord, Lease, LivenessRecord, TriggerRecord,
};
use crate::ports::Table;

/// Record はテーブルと行キーを型に対応付ける
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: Table;

    fn storage_key(&self) -> String;
}

impl Record for JobRecord {
    const TABLE: Table = Table::Jobs;

    fn storage_key(&self) -> String {
        self.key().storage_key()
    }
}

impl Record for TriggerRecord {
    const TABLE: Table = Table::Triggers;

    fn storage_key(&self) -> String {
        self.key.storage_key()
    }
}

impl Record for Lease {
    const TABLE: Table = Table::Locks;

    fn storage_key(&self) -> String {
        Lease::storage_key(self)
    }
}

impl Record for LivenessRecord {
    const TABLE: Table = Table::Schedulers;

    fn storage_key(&self) -> String {
        LivenessRecord::storage_key(&self.scheduler_name, &self.instance_id)
    }
}

/// Calendar row keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRecord {
    pub name: String,
    pub calendar: Calendar,
}

impl Record for CalendarRecord {
    const TABLE: Table = Table::Calendars;

    fn storage_key(&self) -> String {
        self.name.clone()
    }
}
