//! TriggerLedger - triggers テーブルと状態遷移
//!
//! 状態遷移はすべて `update_record`（バージョン付き条件付き書き込み）で行います。
//! 競合に負けた場合は数回だけ読み直して再試行し、それでも駄目なら false を返します。

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::cas::{
    CasOutcome, get_record, get_versioned, insert_record, key_group, put_record, replace_record, scan_records,
    str_field, update_record,
};
use crate::domain::{GroupMatcher, JobKey, PersistenceError, TriggerKey, TriggerRecord, TriggerState};
use crate::ports::{Row, Store, Table, all_rows};

const MAX_TRANSITION_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct TriggerLedger {
    store: Arc<dyn Store>,
}

impl TriggerLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, PersistenceError> {
        get_record(self.store.as_ref(), &key.storage_key()).await
    }

    pub async fn get_versioned(&self, key: &TriggerKey) -> Result<Option<(TriggerRecord, u64)>, PersistenceError> {
        get_versioned(self.store.as_ref(), &key.storage_key()).await
    }

    pub async fn exists(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        Ok(self.store.get(Table::Triggers, &key.storage_key()).await?.is_some())
    }

    pub async fn state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, PersistenceError> {
        Ok(self.get(key).await?.map(|trigger| trigger.state))
    }

    /// Insert-if-absent.
    pub async fn insert(&self, trigger: &TriggerRecord) -> Result<bool, PersistenceError> {
        insert_record(self.store.as_ref(), trigger).await
    }

    pub async fn put(&self, trigger: &TriggerRecord) -> Result<(), PersistenceError> {
        put_record(self.store.as_ref(), trigger).await?;
        Ok(())
    }

    /// Writes `trigger` only if its row is still at `version`.
    pub async fn replace_if_version(&self, trigger: &TriggerRecord, version: u64) -> Result<bool, PersistenceError> {
        replace_record(self.store.as_ref(), trigger, version).await
    }

    pub async fn remove(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        Ok(self.store.delete(Table::Triggers, &key.storage_key()).await?)
    }

    /// Moves the trigger to `to` if its current state is one of `from`.
    pub async fn transition(
        &self,
        key: &TriggerKey,
        from: &[TriggerState],
        to: TriggerState,
    ) -> Result<bool, PersistenceError> {
        self.update(key, |trigger| {
            if !from.contains(&trigger.state) {
                return false;
            }
            trigger.state = to;
            if to != TriggerState::Acquired {
                trigger.fire_instance_id = None;
            }
            true
        })
        .await
    }

    /// Applies `mutate` with a version check, re-reading on lost races.
    pub async fn update<F>(&self, key: &TriggerKey, mutate: F) -> Result<bool, PersistenceError>
    where
        F: Fn(&mut TriggerRecord) -> bool + Send + Sync,
    {
        let storage_key = key.storage_key();
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            match update_record::<TriggerRecord, _>(self.store.as_ref(), &storage_key, &mutate).await? {
                CasOutcome::Applied(_) => return Ok(true),
                CasOutcome::Rejected(_) | CasOutcome::Missing => return Ok(false),
                CasOutcome::Conflict => continue,
            }
        }
        debug!(trigger = %key, "giving up on trigger update after repeated conflicts");
        Ok(false)
    }

    /// WAITING triggers due no later than `horizon`, plus WAITING triggers with
    /// no next fire time (exhausted, to be cleaned up). Sorted by next fire
    /// time, then priority descending, then key.
    pub async fn find_eligible(&self, horizon: DateTime<Utc>) -> Result<Vec<TriggerRecord>, PersistenceError> {
        let filter = |row: &Row| str_field(row, "state") == Some(TriggerState::Waiting.as_str());
        let mut candidates: Vec<TriggerRecord> = scan_records(self.store.as_ref(), &filter).await?;
        candidates.retain(|trigger| trigger.next_fire_time.is_none_or(|next| next <= horizon));
        candidates.sort_by(acquisition_order);
        Ok(candidates)
    }

    pub async fn find_by_job(&self, job_key: &JobKey) -> Result<Vec<TriggerRecord>, PersistenceError> {
        let filter = |row: &Row| {
            row.value.get("job_key").is_some_and(|key| {
                key.get("name").and_then(|n| n.as_str()) == Some(job_key.name())
                    && key.get("group").and_then(|g| g.as_str()) == Some(job_key.group())
            })
        };
        scan_records(self.store.as_ref(), &filter).await
    }

    pub async fn count_by_job(&self, job_key: &JobKey) -> Result<usize, PersistenceError> {
        Ok(self.find_by_job(job_key).await?.len())
    }

    pub async fn find_by_calendar(&self, calendar_name: &str) -> Result<Vec<TriggerRecord>, PersistenceError> {
        let filter = |row: &Row| str_field(row, "calendar_name") == Some(calendar_name);
        scan_records(self.store.as_ref(), &filter).await
    }

    pub async fn find_without_next_fire_time(&self) -> Result<Vec<TriggerRecord>, PersistenceError> {
        let filter = |row: &Row| row.value.get("next_fire_time").is_none_or(|v| v.is_null());
        scan_records(self.store.as_ref(), &filter).await
    }

    pub async fn find_in_groups(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerRecord>, PersistenceError> {
        let filter = |row: &Row| key_group(row).is_some_and(|group| matcher.matches(group));
        scan_records(self.store.as_ref(), &filter).await
    }

    pub async fn keys_matching(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>, PersistenceError> {
        let triggers = self.find_in_groups(matcher).await?;
        Ok(triggers.into_iter().map(|trigger| trigger.key).collect())
    }

    pub async fn group_names(&self) -> Result<Vec<String>, PersistenceError> {
        let rows = self.store.scan(Table::Triggers, &all_rows).await?;
        let groups: BTreeSet<String> = rows.iter().filter_map(key_group).map(str::to_string).collect();
        Ok(groups.into_iter().collect())
    }

    pub async fn all(&self) -> Result<Vec<TriggerRecord>, PersistenceError> {
        scan_records(self.store.as_ref(), &all_rows).await
    }

    pub async fn count(&self) -> Result<usize, PersistenceError> {
        Ok(self.store.scan(Table::Triggers, &all_rows).await?.len())
    }

    /// Moves every trigger of the job in one of `from` to `to`; returns how many moved.
    pub async fn set_state_by_job(
        &self,
        job_key: &JobKey,
        from: &[TriggerState],
        to: TriggerState,
    ) -> Result<usize, PersistenceError> {
        let mut moved = 0;
        for trigger in self.find_by_job(job_key).await? {
            if from.contains(&trigger.state) && self.transition(&trigger.key, from, to).await? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        Ok(self.store.truncate(Table::Triggers).await?)
    }
}

/// Earlier fire time first, then higher priority, then key.
pub fn acquisition_order(a: &TriggerRecord, b: &TriggerRecord) -> Ordering {
    a.next_fire_time
        .cmp(&b.next_fire_time)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Schedule;
    use crate::impls::InMemoryStore;
    use chrono::{TimeDelta, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn trigger(name: &str, at: DateTime<Utc>, priority: i32) -> TriggerRecord {
        TriggerRecord::new(TriggerKey::new(name, "g1"), JobKey::new("j1", "g1"), Schedule::one_shot(), at)
            .with_priority(priority)
    }

    fn ledger() -> TriggerLedger {
        TriggerLedger::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn eligible_triggers_are_ordered_by_time_then_priority_then_key() {
        let ledger = ledger();
        ledger.put(&trigger("late", now() + TimeDelta::seconds(5), 10)).await.unwrap();
        ledger.put(&trigger("b-low", now(), 5)).await.unwrap();
        ledger.put(&trigger("a-low", now(), 5)).await.unwrap();
        ledger.put(&trigger("high", now(), 10)).await.unwrap();
        ledger.put(&trigger("too-late", now() + TimeDelta::minutes(5), 10)).await.unwrap();

        let found = ledger.find_eligible(now() + TimeDelta::seconds(30)).await.unwrap();
        let names: Vec<_> = found.iter().map(|t| t.key.name().to_string()).collect();
        assert_eq!(names, vec!["high", "a-low", "b-low", "late"]);
    }

    #[tokio::test]
    async fn paused_triggers_are_not_eligible() {
        let ledger = ledger();
        let mut paused = trigger("p", now(), 5);
        paused.state = TriggerState::Paused;
        ledger.put(&paused).await.unwrap();

        assert!(ledger.find_eligible(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transition_checks_the_current_state() {
        let ledger = ledger();
        let t = trigger("t", now(), 5);
        ledger.put(&t).await.unwrap();

        assert!(!ledger.transition(&t.key, &[TriggerState::Paused], TriggerState::Waiting).await.unwrap());
        assert!(ledger.transition(&t.key, &[TriggerState::Waiting], TriggerState::Paused).await.unwrap());
        assert_eq!(ledger.state(&t.key).await.unwrap(), Some(TriggerState::Paused));
        assert!(!ledger.transition(&TriggerKey::new("nope", "g1"), &[TriggerState::Waiting], TriggerState::Paused).await.unwrap());
    }

    #[tokio::test]
    async fn job_scoped_queries() {
        let ledger = ledger();
        ledger.put(&trigger("a", now(), 5)).await.unwrap();
        ledger.put(&trigger("b", now(), 5)).await.unwrap();
        let other = TriggerRecord::new(TriggerKey::new("c", "g2"), JobKey::new("j2", "g1"), Schedule::one_shot(), now());
        ledger.put(&other).await.unwrap();

        let job = JobKey::new("j1", "g1");
        assert_eq!(ledger.count_by_job(&job).await.unwrap(), 2);
        let moved = ledger
            .set_state_by_job(&job, &[TriggerState::Waiting], TriggerState::Blocked)
            .await
            .unwrap();
        assert_eq!(moved, 2);
        assert_eq!(ledger.state(&other.key).await.unwrap(), Some(TriggerState::Waiting));
        assert_eq!(ledger.group_names().await.unwrap(), vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn exhausted_triggers_are_found() {
        let ledger = ledger();
        ledger.put(&trigger("done", now(), 5).with_next_fire_time(None)).await.unwrap();
        ledger.put(&trigger("live", now(), 5)).await.unwrap();

        let exhausted = ledger.find_without_next_fire_time().await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].key.name(), "done");
    }
}
