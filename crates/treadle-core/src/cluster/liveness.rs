//! LivenessRegistry - schedulers テーブル
//!
//! 各ノードは自分の行だけを書き込みます（check_in）。他ノードの行は読むだけで、
//! 失効判定に使います。

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::dao::cas::{get_record, put_record, scan_records};
use crate::domain::{LivenessRecord, PersistenceError};
use crate::ports::{Clock, Row, Store, Table};

#[derive(Clone)]
pub struct LivenessRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    scheduler_name: String,
    instance_id: String,
    checkin_interval: Duration,
    defunct_multiplier: u32,
}

impl LivenessRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        scheduler_name: impl Into<String>,
        instance_id: impl Into<String>,
        checkin_interval: Duration,
        defunct_multiplier: u32,
    ) -> Self {
        Self {
            store,
            clock,
            scheduler_name: scheduler_name.into(),
            instance_id: instance_id.into(),
            checkin_interval,
            defunct_multiplier,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_self(&self, instance_id: &str) -> bool {
        self.instance_id == instance_id
    }

    /// Writes this node's liveness row stamped with the current time.
    pub async fn check_in(&self) -> Result<LivenessRecord, PersistenceError> {
        let record = LivenessRecord {
            scheduler_name: self.scheduler_name.clone(),
            instance_id: self.instance_id.clone(),
            last_checkin: self.clock.now(),
            checkin_interval_ms: u64::try_from(self.checkin_interval.as_millis()).unwrap_or(u64::MAX),
        };
        put_record(self.store.as_ref(), &record).await?;
        debug!(instance = %self.instance_id, at = %record.last_checkin, "checked in");
        Ok(record)
    }

    pub async fn find_instance(&self, instance_id: &str) -> Result<Option<LivenessRecord>, PersistenceError> {
        let key = LivenessRecord::storage_key(&self.scheduler_name, instance_id);
        get_record(self.store.as_ref(), &key).await
    }

    /// Liveness rows of this scheduler, least recently checked in first.
    pub async fn all_by_checkin_time(&self) -> Result<Vec<LivenessRecord>, PersistenceError> {
        let scheduler_name = self.scheduler_name.as_str();
        let filter = |row: &Row| {
            row.value.get("scheduler_name").and_then(|v| v.as_str()) == Some(scheduler_name)
        };
        let mut records: Vec<LivenessRecord> = scan_records(self.store.as_ref(), &filter).await?;
        records.sort_by(|a, b| {
            a.last_checkin
                .cmp(&b.last_checkin)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(records)
    }

    pub fn is_defunct(&self, record: &LivenessRecord) -> bool {
        record.is_defunct(self.clock.now(), self.defunct_multiplier)
    }

    /// Peers that stopped checking in.
    pub async fn defunct_instances(&self) -> Result<Vec<LivenessRecord>, PersistenceError> {
        let records = self.all_by_checkin_time().await?;
        Ok(records
            .into_iter()
            .filter(|record| !self.is_self(&record.instance_id) && self.is_defunct(record))
            .collect())
    }

    /// Drops this node's row on clean shutdown.
    pub async fn remove_self(&self) -> Result<bool, PersistenceError> {
        self.remove_instance(&self.instance_id).await
    }

    pub async fn remove_instance(&self, instance_id: &str) -> Result<bool, PersistenceError> {
        let key = LivenessRecord::storage_key(&self.scheduler_name, instance_id);
        Ok(self.store.delete(Table::Schedulers, &key).await?)
    }
}
