//! Persister - ジョブ・トリガー・カレンダーの保存と削除
//!
//! # ルール
//! - 存在しないジョブを参照するトリガーは保存できない（JobNotFound）
//! - 非 durable ジョブは最後のトリガーが消えると一緒に消える（orphan cascade）
//! - トリガーの置き換えは同じジョブに対してのみ（JobMismatch）
//! - 新しいトリガーは、トリガーグループかジョブグループが一時停止中なら PAUSED で始まる

use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::LeaseLock;
use crate::dao::{CalendarDao, JobDao, PausedGroups, TriggerLedger};
use crate::domain::{
    Calendar, JobDetail, JobKey, JobRecord, PersistenceError, TriggerKey, TriggerRecord, TriggerState,
};
use crate::ports::{IdGenerator, Store};
use crate::typed::{JobTypeDescriptor, JobTypeRegistry};

const MAX_REPLACE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct Persister {
    jobs: JobDao,
    triggers: TriggerLedger,
    calendars: CalendarDao,
    paused_trigger_groups: PausedGroups,
    paused_job_groups: PausedGroups,
    registry: Arc<JobTypeRegistry>,
    ids: Arc<dyn IdGenerator>,
    locks: LeaseLock,
}

impl Persister {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<JobTypeRegistry>,
        ids: Arc<dyn IdGenerator>,
        locks: LeaseLock,
    ) -> Self {
        Self {
            jobs: JobDao::new(store.clone()),
            triggers: TriggerLedger::new(store.clone()),
            calendars: CalendarDao::new(store.clone()),
            paused_trigger_groups: PausedGroups::triggers(store.clone()),
            paused_job_groups: PausedGroups::jobs(store),
            registry,
            ids,
            locks,
        }
    }

    pub fn descriptor(&self, job: &JobRecord) -> Result<&JobTypeDescriptor, PersistenceError> {
        self.registry.resolve(&job.detail.job_type)
    }

    pub async fn store_job(&self, detail: JobDetail, replace: bool) -> Result<JobRecord, PersistenceError> {
        self.registry.resolve(&detail.job_type)?;
        let existing = self.jobs.get(&detail.key).await?;
        if existing.is_some() && !replace {
            return Err(already_exists("job", &detail.key));
        }
        let job_id = match &existing {
            Some(job) => job.job_id,
            None => self.ids.generate_job_id(),
        };
        let record = JobRecord::new(job_id, detail);
        if replace {
            self.jobs.put(&record).await?;
        } else if !self.jobs.insert(&record).await? {
            return Err(already_exists("job", record.key()));
        }
        debug!(job = %record.key(), job_id = %record.job_id, replace, "job stored");
        Ok(record)
    }

    pub async fn store_trigger(&self, trigger: TriggerRecord, replace: bool) -> Result<TriggerRecord, PersistenceError> {
        let trigger = self.prepare_trigger(trigger).await?;
        if replace {
            self.triggers.put(&trigger).await?;
        } else if !self.triggers.insert(&trigger).await? {
            return Err(already_exists("trigger", &trigger.key));
        }
        debug!(trigger = %trigger.key, job = %trigger.job_key, state = ?trigger.state, "trigger stored");
        Ok(trigger)
    }

    /// Validates `trigger` against its job and calendar and fills in the
    /// stored fields. Nothing is written.
    async fn prepare_trigger(&self, mut trigger: TriggerRecord) -> Result<TriggerRecord, PersistenceError> {
        trigger.schedule.validate()?;
        let job = self
            .jobs
            .get(&trigger.job_key)
            .await?
            .ok_or_else(|| PersistenceError::JobNotFound(trigger.job_key.to_string()))?;
        let calendar = match trigger.calendar_name.as_deref() {
            Some(name) => Some(
                self.calendars
                    .get(name)
                    .await?
                    .ok_or_else(|| PersistenceError::CalendarNotFound(name.to_string()))?,
            ),
            None => None,
        };
        if trigger.previous_fire_time.is_none() && calendar.is_some() {
            trigger.compute_first_fire_time(calendar.as_ref());
        }

        trigger.job_id = Some(job.job_id);
        trigger.fire_instance_id = None;
        trigger.executing = false;
        trigger.state = self.initial_state(&trigger, &job).await?;
        Ok(trigger)
    }

    async fn initial_state(&self, trigger: &TriggerRecord, job: &JobRecord) -> Result<TriggerState, PersistenceError> {
        if self.paused_trigger_groups.is_paused(trigger.key.group()).await?
            || self.paused_job_groups.is_paused(trigger.job_key.group()).await?
        {
            return Ok(TriggerState::Paused);
        }
        let exclusive = self
            .registry
            .get(&job.detail.job_type)
            .is_some_and(|descriptor| descriptor.disallow_concurrent_execution);
        if exclusive && self.locks.is_held(&trigger.job_key).await? {
            return Ok(TriggerState::Blocked);
        }
        Ok(TriggerState::Waiting)
    }

    pub async fn store_job_and_trigger(
        &self,
        detail: JobDetail,
        trigger: TriggerRecord,
    ) -> Result<(JobRecord, TriggerRecord), PersistenceError> {
        let job = self.store_job(detail, false).await?;
        let trigger = self.store_trigger(trigger, false).await?;
        Ok((job, trigger))
    }

    /// Stores each job followed by its triggers.
    pub async fn store_jobs_and_triggers(
        &self,
        entries: Vec<(JobDetail, Vec<TriggerRecord>)>,
        replace: bool,
    ) -> Result<(), PersistenceError> {
        if !replace {
            for (detail, triggers) in &entries {
                if self.jobs.exists(&detail.key).await? {
                    return Err(already_exists("job", &detail.key));
                }
                for trigger in triggers {
                    if self.triggers.exists(&trigger.key).await? {
                        return Err(already_exists("trigger", &trigger.key));
                    }
                }
            }
        }
        for (detail, triggers) in entries {
            self.store_job(detail, replace).await?;
            for trigger in triggers {
                self.store_trigger(trigger, replace).await?;
            }
        }
        Ok(())
    }

    /// Removes the trigger; a non-durable job left without triggers goes too.
    pub async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        let Some(trigger) = self.triggers.get(key).await? else {
            return Ok(false);
        };
        if !self.triggers.remove(key).await? {
            return Ok(false);
        }
        debug!(trigger = %key, "trigger removed");
        self.remove_orphaned_job(&trigger.job_key).await?;
        Ok(true)
    }

    /// Removes the trigger only if it still has no next fire time.
    pub async fn remove_trigger_without_next_fire_time(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        match self.triggers.get(key).await? {
            Some(trigger) if trigger.next_fire_time.is_none() => self.remove_trigger(key).await,
            _ => Ok(false),
        }
    }

    pub async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<bool, PersistenceError> {
        let mut all_removed = true;
        for key in keys {
            all_removed &= self.remove_trigger(key).await?;
        }
        Ok(all_removed)
    }

    async fn remove_orphaned_job(&self, job_key: &JobKey) -> Result<(), PersistenceError> {
        let Some(job) = self.jobs.get(job_key).await? else {
            return Ok(());
        };
        if job.detail.durable || self.triggers.count_by_job(job_key).await? > 0 {
            return Ok(());
        }
        if self.jobs.remove(job_key).await? {
            info!(job = %job_key, "removed non-durable job without triggers");
        }
        Ok(())
    }

    /// Swaps the trigger stored under `key` for `replacement`, which must
    /// target the same job. Returns false when nothing is stored under `key`
    /// or the stored trigger kept changing underneath.
    ///
    /// The replacement is fully validated before the original is touched;
    /// a failed replacement leaves the original in place.
    pub async fn replace_trigger(&self, key: &TriggerKey, replacement: TriggerRecord) -> Result<bool, PersistenceError> {
        for _ in 0..MAX_REPLACE_ATTEMPTS {
            let Some((original, version)) = self.triggers.get_versioned(key).await? else {
                return Ok(false);
            };
            if original.job_key != replacement.job_key {
                return Err(PersistenceError::JobMismatch {
                    original: original.job_key.to_string(),
                    replacement: replacement.job_key.to_string(),
                });
            }
            let renamed = replacement.key != *key;
            if renamed && self.triggers.exists(&replacement.key).await? {
                return Err(already_exists("trigger", &replacement.key));
            }
            let mut candidate = replacement.clone();
            for (data_key, value) in &original.job_data {
                candidate
                    .job_data
                    .entry(data_key.clone())
                    .or_insert_with(|| value.clone());
            }
            let candidate = self.prepare_trigger(candidate).await?;

            if renamed {
                if !self.triggers.insert(&candidate).await? {
                    return Err(already_exists("trigger", &candidate.key));
                }
                self.triggers.remove(key).await?;
            } else if !self.triggers.replace_if_version(&candidate, version).await? {
                continue;
            }
            info!(trigger = %key, replacement = %candidate.key, "trigger replaced");
            return Ok(true);
        }
        debug!(trigger = %key, "giving up on trigger replacement after repeated conflicts");
        Ok(false)
    }

    /// Removes the job and all of its triggers.
    pub async fn remove_job(&self, key: &JobKey) -> Result<bool, PersistenceError> {
        for trigger in self.triggers.find_by_job(key).await? {
            self.triggers.remove(&trigger.key).await?;
        }
        let removed = self.jobs.remove(key).await?;
        if removed {
            debug!(job = %key, "job removed");
        }
        Ok(removed)
    }

    pub async fn remove_jobs(&self, keys: &[JobKey]) -> Result<bool, PersistenceError> {
        let mut all_removed = true;
        for key in keys {
            all_removed &= self.remove_job(key).await?;
        }
        Ok(all_removed)
    }

    /// Stores a calendar; with `update_triggers` the next fire time of every
    /// trigger using it is moved off excluded times.
    pub async fn store_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), PersistenceError> {
        if replace {
            self.calendars.put(name, &calendar).await?;
        } else if !self.calendars.insert(name, &calendar).await? {
            return Err(PersistenceError::AlreadyExists {
                entity: "calendar",
                key: name.to_string(),
            });
        }
        if !update_triggers {
            return Ok(());
        }
        for trigger in self.triggers.find_by_calendar(name).await? {
            self.triggers
                .update(&trigger.key, |stored| {
                    let Some(next) = stored.next_fire_time else {
                        return false;
                    };
                    if calendar.is_time_included(next) {
                        return false;
                    }
                    stored.next_fire_time = stored.included_fire_time_after(next, Some(&calendar));
                    true
                })
                .await?;
        }
        Ok(())
    }

    pub async fn remove_calendar(&self, name: &str) -> Result<bool, PersistenceError> {
        if !self.triggers.find_by_calendar(name).await?.is_empty() {
            return Err(PersistenceError::CalendarInUse(name.to_string()));
        }
        self.calendars.remove(name).await
    }
}

fn already_exists(entity: &'static str, key: &impl std::fmt::Display) -> PersistenceError {
    PersistenceError::AlreadyExists {
        entity,
        key: key.to_string(),
    }
}
