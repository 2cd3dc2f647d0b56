//! JobStore - ホストのスケジューラから見た唯一の入口
//!
//! 各操作は内部のコンポーネントへ委譲するだけです。
//! - ライフサイクル: `start` / `shutdown`（クラスタモードでは check-in と回収ループ）
//! - 発火サイクル: acquire → fired → complete
//! - pause / resume
//! - ジョブ・トリガー・カレンダーの CRUD と問い合わせ

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::builder::Components;
use super::fire_cycle::TriggerFiredResult;
use crate::cluster::{CheckinLoop, ClusterTasks, RecoveryLoop, RecoveryReport};
use crate::domain::{
    Calendar, CompletedExecutionInstruction, GroupMatcher, JobDetail, JobKey, JobRecord, PersistenceError, TriggerKey,
    TriggerRecord, TriggerState,
};
use crate::ports::Clock;

pub struct JobStore {
    inner: Components,
    tasks: Mutex<Option<ClusterTasks>>,
}

impl JobStore {
    pub(crate) fn new(inner: Components) -> Self {
        Self {
            inner,
            tasks: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    pub fn is_clustered(&self) -> bool {
        self.inner.config.clustered
    }

    pub fn registered_job_types(&self) -> Vec<String> {
        self.inner.registry.registered_types()
    }

    /// Current time as seen by the store; hosts should schedule against this.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ---- lifecycle ----

    /// Recovers leftovers from earlier runs; in clustered mode also checks in
    /// and starts the background loops.
    pub async fn start(&self) -> Result<(), PersistenceError> {
        let config = &self.inner.config;
        if config.clustered {
            self.inner.liveness.check_in().await?;
        }
        let report = self.inner.recoverer.recover().await?;
        info!(
            instance = %config.instance_id,
            clustered = config.clustered,
            reclaimed_triggers = report.reclaimed_triggers,
            recovery_triggers = report.recovery_triggers.len(),
            "job store started"
        );

        if config.clustered {
            let mut tasks = self.tasks.lock().await;
            if tasks.is_none() {
                let checkin = CheckinLoop::new(
                    self.inner.liveness.clone(),
                    self.inner.checkin_handler.clone(),
                    config.checkin_interval,
                );
                let recovery = RecoveryLoop::new(self.inner.recoverer.clone(), config.effective_recovery_interval());
                *tasks = Some(ClusterTasks::spawn(checkin, recovery));
            }
        }
        Ok(())
    }

    /// Stops the background loops and removes this node's liveness row.
    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        let tasks = self.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            tasks.shutdown_and_join().await;
        }
        if self.inner.config.clustered {
            self.inner.liveness.remove_self().await?;
        }
        info!(instance = %self.inner.config.instance_id, "job store shut down");
        Ok(())
    }

    /// Writes this node's liveness row outside the periodic loop.
    pub async fn check_in(&self) -> Result<(), PersistenceError> {
        self.inner.liveness.check_in().await?;
        Ok(())
    }

    /// Runs one recovery pass outside the periodic loop.
    pub async fn recover_now(&self) -> Result<RecoveryReport, PersistenceError> {
        self.inner.recoverer.recover().await
    }

    // ---- fire cycle ----

    pub async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<TriggerRecord>, PersistenceError> {
        self.inner.acquirer.acquire_next(no_later_than, max_count, time_window).await
    }

    pub async fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<(), PersistenceError> {
        self.inner.acquirer.release_acquired_trigger(key).await
    }

    pub async fn triggers_fired(&self, triggers: &[TriggerRecord]) -> Vec<TriggerFiredResult> {
        self.inner.fire_cycle.triggers_fired(triggers).await
    }

    pub async fn triggered_job_complete(
        &self,
        trigger: &TriggerRecord,
        job: &JobRecord,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), PersistenceError> {
        self.inner.fire_cycle.triggered_job_complete(trigger, job, instruction).await
    }

    pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        self.inner.state_manager.reset_trigger_from_error_state(key).await
    }

    // ---- pause / resume ----

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        self.inner.state_manager.pause_trigger(key).await
    }

    pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        self.inner.state_manager.pause_triggers(matcher).await
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<(), PersistenceError> {
        self.inner.state_manager.pause_job(key).await
    }

    pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        self.inner.state_manager.pause_jobs(matcher).await
    }

    pub async fn pause_all(&self) -> Result<(), PersistenceError> {
        self.inner.state_manager.pause_all().await
    }

    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        self.inner.state_manager.resume_trigger(key).await
    }

    pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        self.inner.state_manager.resume_triggers(matcher).await
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<(), PersistenceError> {
        self.inner.state_manager.resume_job(key).await
    }

    pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        self.inner.state_manager.resume_jobs(matcher).await
    }

    pub async fn resume_all(&self) -> Result<(), PersistenceError> {
        self.inner.state_manager.resume_all().await
    }

    pub async fn paused_trigger_groups(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.state_manager.paused_trigger_groups().await
    }

    pub async fn paused_job_groups(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.state_manager.paused_job_groups().await
    }

    // ---- jobs ----

    pub async fn store_job(&self, detail: JobDetail, replace: bool) -> Result<JobRecord, PersistenceError> {
        self.inner.persister.store_job(detail, replace).await
    }

    pub async fn store_job_and_trigger(
        &self,
        detail: JobDetail,
        trigger: TriggerRecord,
    ) -> Result<(JobRecord, TriggerRecord), PersistenceError> {
        self.inner.persister.store_job_and_trigger(detail, trigger).await
    }

    pub async fn store_jobs_and_triggers(
        &self,
        entries: Vec<(JobDetail, Vec<TriggerRecord>)>,
        replace: bool,
    ) -> Result<(), PersistenceError> {
        self.inner.persister.store_jobs_and_triggers(entries, replace).await
    }

    pub async fn remove_job(&self, key: &JobKey) -> Result<bool, PersistenceError> {
        self.inner.persister.remove_job(key).await
    }

    pub async fn remove_jobs(&self, keys: &[JobKey]) -> Result<bool, PersistenceError> {
        self.inner.persister.remove_jobs(keys).await
    }

    pub async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobRecord>, PersistenceError> {
        self.inner.jobs.get(key).await
    }

    pub async fn check_job_exists(&self, key: &JobKey) -> Result<bool, PersistenceError> {
        self.inner.jobs.exists(key).await
    }

    /// Whether some node holds the job lease, i.e. a non-concurrent job is executing.
    pub async fn is_job_executing(&self, key: &JobKey) -> Result<bool, PersistenceError> {
        self.inner.locks.is_held(key).await
    }

    // ---- triggers ----

    pub async fn store_trigger(&self, trigger: TriggerRecord, replace: bool) -> Result<TriggerRecord, PersistenceError> {
        self.inner.persister.store_trigger(trigger, replace).await
    }

    pub async fn replace_trigger(&self, key: &TriggerKey, replacement: TriggerRecord) -> Result<bool, PersistenceError> {
        self.inner.persister.replace_trigger(key, replacement).await
    }

    pub async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        self.inner.persister.remove_trigger(key).await
    }

    pub async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<bool, PersistenceError> {
        self.inner.persister.remove_triggers(keys).await
    }

    pub async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, PersistenceError> {
        self.inner.triggers.get(key).await
    }

    pub async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        self.inner.triggers.exists(key).await
    }

    pub async fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<TriggerRecord>, PersistenceError> {
        self.inner.triggers.find_by_job(key).await
    }

    /// `None` when no such trigger is stored.
    pub async fn trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, PersistenceError> {
        self.inner.triggers.state(key).await
    }

    // ---- calendars ----

    pub async fn store_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), PersistenceError> {
        self.inner.persister.store_calendar(name, calendar, replace, update_triggers).await
    }

    pub async fn remove_calendar(&self, name: &str) -> Result<bool, PersistenceError> {
        self.inner.persister.remove_calendar(name).await
    }

    pub async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, PersistenceError> {
        self.inner.calendars.get(name).await
    }

    pub async fn calendar_names(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.calendars.names().await
    }

    // ---- queries ----

    pub async fn number_of_jobs(&self) -> Result<usize, PersistenceError> {
        self.inner.jobs.count().await
    }

    pub async fn number_of_triggers(&self) -> Result<usize, PersistenceError> {
        self.inner.triggers.count().await
    }

    pub async fn number_of_calendars(&self) -> Result<usize, PersistenceError> {
        self.inner.calendars.count().await
    }

    pub async fn job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>, PersistenceError> {
        self.inner.jobs.keys_matching(matcher).await
    }

    pub async fn trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>, PersistenceError> {
        self.inner.triggers.keys_matching(matcher).await
    }

    pub async fn job_group_names(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.jobs.group_names().await
    }

    pub async fn trigger_group_names(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.triggers.group_names().await
    }

    /// Deletes all jobs, triggers, calendars and paused-group rows.
    /// Leases and liveness rows are left to their owners.
    pub async fn clear_all_scheduling_data(&self) -> Result<(), PersistenceError> {
        warn!(instance = %self.inner.config.instance_id, "clearing all scheduling data");
        self.inner.triggers.clear().await?;
        self.inner.jobs.clear().await?;
        self.inner.calendars.clear().await?;
        self.inner.paused_trigger_groups.clear().await?;
        self.inner.paused_job_groups.clear().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::JobStoreBuilder;
    use crate::app::fixture::{report_job, t0, trigger_for};
    use crate::cluster::LoggingCheckinHandler;
    use crate::config::StoreConfig;
    use crate::impls::InMemoryStore;
    use crate::ports::{FixedClock, Store, Table, all_rows};
    use crate::typed::test_kinds::ReportJob;
    use std::sync::Arc;

    fn job_store(store: Arc<InMemoryStore>, clustered: bool) -> JobStore {
        JobStoreBuilder::new(StoreConfig::new("node-a").with_clustered(clustered))
            .store(store)
            .clock(Arc::new(FixedClock::new(t0())))
            .checkin_error_handler(Arc::new(LoggingCheckinHandler::default()))
            .register_job_type::<ReportJob>()
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn clustered_start_checks_in_and_shutdown_leaves() {
        let store = Arc::new(InMemoryStore::new());
        let job_store = job_store(store.clone(), true);

        job_store.start().await.unwrap();
        assert_eq!(store.scan(Table::Schedulers, &all_rows).await.unwrap().len(), 1);

        job_store.shutdown().await.unwrap();
        assert!(store.scan(Table::Schedulers, &all_rows).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn standalone_start_writes_no_liveness_row() {
        let store = Arc::new(InMemoryStore::new());
        let job_store = job_store(store.clone(), false);

        job_store.start().await.unwrap();
        assert!(store.scan(Table::Schedulers, &all_rows).await.unwrap().is_empty());
        job_store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn crud_and_queries() {
        let job_store = job_store(Arc::new(InMemoryStore::new()), false);
        let job = report_job("j1");
        job_store
            .store_job_and_trigger(job.clone(), trigger_for("t1", &job.key, t0()))
            .await
            .unwrap();
        job_store.store_calendar("holidays", Calendar::new(), false, false).await.unwrap();

        assert!(job_store.check_job_exists(&job.key).await.unwrap());
        assert_eq!(job_store.triggers_for_job(&job.key).await.unwrap().len(), 1);
        assert_eq!(
            job_store.trigger_state(&TriggerKey::new("t1", "g1")).await.unwrap(),
            Some(TriggerState::Waiting)
        );
        assert_eq!(job_store.trigger_state(&TriggerKey::new("nope", "g1")).await.unwrap(), None);
        assert_eq!(job_store.job_group_names().await.unwrap(), vec!["g1".to_string()]);
        assert_eq!(job_store.trigger_keys(&GroupMatcher::Contains("1".into())).await.unwrap().len(), 1);
        assert_eq!(job_store.calendar_names().await.unwrap(), vec!["holidays".to_string()]);

        job_store.pause_triggers(&GroupMatcher::equals("g1")).await.unwrap();
        job_store.pause_jobs(&GroupMatcher::equals("g1")).await.unwrap();
        assert_eq!(job_store.paused_job_groups().await.unwrap(), vec!["g1".to_string()]);
        job_store.clear_all_scheduling_data().await.unwrap();
        assert_eq!(job_store.number_of_jobs().await.unwrap(), 0);
        assert_eq!(job_store.number_of_triggers().await.unwrap(), 0);
        assert_eq!(job_store.number_of_calendars().await.unwrap(), 0);
        assert!(job_store.paused_trigger_groups().await.unwrap().is_empty());
        assert!(job_store.paused_job_groups().await.unwrap().is_empty());
    }
}
