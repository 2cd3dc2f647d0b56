//! FireCycle - 取得済みトリガーの発火と完了
//!
//! - `triggers_fired`: ACQUIRED のトリガーのスケジュールを進め、ホストに渡す
//!   バンドルを作る。失敗はトリガー単位で、バッチ全体は止めない。
//!   発火したトリガーには executing 印を付ける（復旧はこの印で実行中断を判断する）
//! - `triggered_job_complete`: 実行後のジョブデータ保存、ブロック解除、
//!   executing 印の解除、完了指示の適用、trigger リースの解放

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::persister::Persister;
use crate::cluster::LeaseLock;
use crate::dao::{CalendarDao, CasOutcome, JobDao, TriggerLedger, update_record};
use crate::domain::{
    Calendar, CompletedExecutionInstruction, JobRecord, PersistenceError, RECOVERY_GROUP, TriggerKey, TriggerRecord,
    TriggerState,
};
use crate::ports::{Clock, Store};

const ANY_STATE: [TriggerState; 6] = [
    TriggerState::Waiting,
    TriggerState::Paused,
    TriggerState::Acquired,
    TriggerState::Blocked,
    TriggerState::Complete,
    TriggerState::Error,
];

/// Everything the host needs to run one job execution.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobRecord,
    pub trigger: TriggerRecord,
    pub calendar: Option<Calendar>,
    /// The trigger is a recovery trigger re-running an interrupted job.
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Per-trigger outcome of `triggers_fired`.
#[derive(Debug)]
pub enum TriggerFiredResult {
    Fired(Box<TriggerFiredBundle>),
    /// Not fired; the trigger was handed back.
    Skipped,
    Failed(PersistenceError),
}

impl TriggerFiredResult {
    pub fn bundle(&self) -> Option<&TriggerFiredBundle> {
        match self {
            TriggerFiredResult::Fired(bundle) => Some(bundle),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct FireCycle {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    jobs: JobDao,
    triggers: TriggerLedger,
    calendars: CalendarDao,
    locks: LeaseLock,
    persister: Persister,
}

impl FireCycle {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, locks: LeaseLock, persister: Persister) -> Self {
        Self {
            jobs: JobDao::new(store.clone()),
            triggers: TriggerLedger::new(store.clone()),
            calendars: CalendarDao::new(store.clone()),
            store,
            clock,
            locks,
            persister,
        }
    }

    pub async fn triggers_fired(&self, acquired: &[TriggerRecord]) -> Vec<TriggerFiredResult> {
        let mut results = Vec::with_capacity(acquired.len());
        for trigger in acquired {
            let result = match self.trigger_fired(trigger).await {
                Ok(Some(bundle)) => TriggerFiredResult::Fired(Box::new(bundle)),
                Ok(None) => {
                    self.hand_back(&trigger.key).await;
                    TriggerFiredResult::Skipped
                }
                Err(err) => {
                    warn!(trigger = %trigger.key, error = %err, "trigger could not be fired");
                    self.hand_back(&trigger.key).await;
                    TriggerFiredResult::Failed(err)
                }
            };
            results.push(result);
        }
        results
    }

    /// Best effort ACQUIRED -> WAITING plus lease release.
    async fn hand_back(&self, key: &TriggerKey) {
        if let Err(err) = self.try_hand_back(key).await {
            warn!(trigger = %key, error = %err, "could not hand back trigger");
        }
    }

    async fn try_hand_back(&self, key: &TriggerKey) -> Result<(), PersistenceError> {
        self.triggers
            .transition(key, &[TriggerState::Acquired], TriggerState::Waiting)
            .await?;
        self.locks.release(key).await?;
        Ok(())
    }

    async fn trigger_fired(&self, acquired: &TriggerRecord) -> Result<Option<TriggerFiredBundle>, PersistenceError> {
        let Some((stored, version)) = self.triggers.get_versioned(&acquired.key).await? else {
            return Ok(None);
        };
        if stored.state != TriggerState::Acquired || stored.fire_instance_id != acquired.fire_instance_id {
            debug!(trigger = %acquired.key, state = ?stored.state, "trigger no longer acquired by this fire");
            return Ok(None);
        }
        let calendar = match stored.calendar_name.as_deref() {
            Some(name) => match self.calendars.get(name).await? {
                Some(calendar) => Some(calendar),
                None => {
                    warn!(trigger = %stored.key, calendar = name, "calendar is missing; not firing");
                    return Ok(None);
                }
            },
            None => None,
        };
        let job = self
            .jobs
            .get(&stored.job_key)
            .await?
            .ok_or_else(|| PersistenceError::JobNotFound(stored.job_key.to_string()))?;
        let exclusive = self.persister.descriptor(&job)?.disallow_concurrent_execution;

        if exclusive && !self.locks.acquire(job.key()).await? {
            let mut blocked = stored;
            blocked.state = TriggerState::Blocked;
            blocked.fire_instance_id = None;
            self.triggers.replace_if_version(&blocked, version).await?;
            self.locks.release(&blocked.key).await?;
            debug!(trigger = %blocked.key, job = %job.key(), "job is running elsewhere; trigger blocked");
            return Ok(None);
        }

        let mut trigger = stored;
        let previous_fire_time = trigger.previous_fire_time;
        trigger.triggered(calendar.as_ref());
        trigger.executing = true;
        trigger.state = if trigger.next_fire_time.is_none() {
            TriggerState::Complete
        } else if exclusive {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };

        if !self.triggers.replace_if_version(&trigger, version).await? {
            if exclusive {
                self.locks.release(job.key()).await?;
            }
            return Ok(None);
        }
        if exclusive {
            self.triggers
                .set_state_by_job(job.key(), &[TriggerState::Waiting], TriggerState::Blocked)
                .await?;
        }

        debug!(trigger = %trigger.key, job = %job.key(), next = ?trigger.next_fire_time, "trigger fired");
        Ok(Some(TriggerFiredBundle {
            recovering: trigger.key.group() == RECOVERY_GROUP,
            fire_time: self.clock.now(),
            scheduled_fire_time: trigger.previous_fire_time,
            previous_fire_time,
            next_fire_time: trigger.next_fire_time,
            job,
            trigger,
            calendar,
        }))
    }

    pub async fn triggered_job_complete(
        &self,
        trigger: &TriggerRecord,
        job: &JobRecord,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), PersistenceError> {
        let descriptor = self.persister.descriptor(job)?.clone();
        if descriptor.persist_job_data_after_execution {
            self.persist_job_data(job).await?;
        }
        if descriptor.disallow_concurrent_execution {
            self.triggers
                .set_state_by_job(job.key(), &[TriggerState::Blocked], TriggerState::Waiting)
                .await?;
            self.locks.release(job.key()).await?;
        }

        self.triggers
            .update(&trigger.key, |stored| std::mem::take(&mut stored.executing))
            .await?;

        match instruction {
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {}
            CompletedExecutionInstruction::DeleteTrigger => {
                if trigger.next_fire_time.is_none() {
                    // the stored copy may have been rescheduled while the job ran
                    self.persister
                        .remove_trigger_without_next_fire_time(&trigger.key)
                        .await?;
                } else {
                    self.persister.remove_trigger(&trigger.key).await?;
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.triggers.transition(&trigger.key, &ANY_STATE, TriggerState::Complete).await?;
            }
            CompletedExecutionInstruction::SetTriggerError => {
                info!(trigger = %trigger.key, "trigger set to error state");
                self.triggers.transition(&trigger.key, &ANY_STATE, TriggerState::Error).await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                self.triggers
                    .set_state_by_job(job.key(), &ANY_STATE, TriggerState::Complete)
                    .await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                info!(job = %job.key(), "all triggers of job set to error state");
                self.triggers
                    .set_state_by_job(job.key(), &ANY_STATE, TriggerState::Error)
                    .await?;
            }
        }

        self.locks.release(&trigger.key).await?;
        Ok(())
    }

    async fn persist_job_data(&self, job: &JobRecord) -> Result<(), PersistenceError> {
        let job_data = job.detail.job_data.clone();
        let outcome = update_record::<JobRecord, _>(self.store.as_ref(), &job.key().storage_key(), move |stored| {
            if stored.detail.job_data == job_data {
                return false;
            }
            stored.detail.job_data = job_data;
            true
        })
        .await?;
        if matches!(outcome, CasOutcome::Conflict) {
            warn!(job = %job.key(), "job changed while saving its data; keeping the stored copy");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::fixture::{self, exclusive_job, report_job, t0, trigger_for};
    use crate::domain::Schedule;
    use serde_json::json;
    use std::time::Duration;

    fn every_minute(name: &str, job: &crate::domain::JobKey) -> TriggerRecord {
        TriggerRecord::new(
            TriggerKey::new(name, "g1"),
            job.clone(),
            Schedule::repeat_forever(Duration::from_secs(60)),
            t0(),
        )
    }

    #[tokio::test]
    async fn firing_advances_the_schedule() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(every_minute("t1", &job.key), false).await.unwrap();

        let acquired = node.acquirer.acquire_next(t0(), 1, Duration::ZERO).await.unwrap();
        let results = node.fire_cycle.triggers_fired(&acquired).await;
        let bundle = results[0].bundle().unwrap();

        assert_eq!(bundle.scheduled_fire_time, Some(t0()));
        assert_eq!(bundle.previous_fire_time, None);
        assert_eq!(bundle.next_fire_time, Some(t0() + chrono::TimeDelta::minutes(1)));
        assert!(!bundle.recovering);
        assert_eq!(bundle.job.key(), &job.key);

        let stored = node.triggers.get(&bundle.trigger.key).await.unwrap().unwrap();
        assert_eq!(stored.state, TriggerState::Waiting);
        assert!(stored.executing);
        assert!(node.locks.is_held(&stored.key).await.unwrap());

        node.fire_cycle
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();
        assert!(!node.locks.is_held(&stored.key).await.unwrap());
        let completed = node.triggers.get(&stored.key).await.unwrap().unwrap();
        assert!(!completed.executing);
    }

    #[tokio::test]
    async fn exhausted_trigger_completes_and_is_deleted() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(trigger_for("once", &job.key, t0()), false).await.unwrap();

        let acquired = node.acquirer.acquire_next(t0(), 1, Duration::ZERO).await.unwrap();
        let results = node.fire_cycle.triggers_fired(&acquired).await;
        let bundle = results[0].bundle().unwrap().clone();
        assert_eq!(bundle.trigger.state, TriggerState::Complete);

        node.fire_cycle
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::DeleteTrigger)
            .await
            .unwrap();
        assert_eq!(node.triggers.count().await.unwrap(), 0);
        assert!(!node.jobs.exists(&job.key).await.unwrap());
    }

    #[tokio::test]
    async fn exclusive_job_blocks_its_other_triggers_until_complete() {
        let node = fixture::single_node();
        let job = exclusive_job("j1").with_data("runs", 0);
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(every_minute("a", &job.key), false).await.unwrap();
        node.persister.store_trigger(every_minute("b", &job.key), false).await.unwrap();

        let acquired = node.acquirer.acquire_next(t0(), 5, Duration::ZERO).await.unwrap();
        let results = node.fire_cycle.triggers_fired(&acquired).await;
        let bundle = results[0].bundle().unwrap().clone();

        assert!(node.locks.is_held(&job.key).await.unwrap());
        assert_eq!(node.triggers.state(&TriggerKey::new("a", "g1")).await.unwrap(), Some(TriggerState::Blocked));
        assert_eq!(node.triggers.state(&TriggerKey::new("b", "g1")).await.unwrap(), Some(TriggerState::Blocked));

        let mut finished = bundle.job.clone();
        finished.detail.job_data.insert("runs".into(), json!(1));
        node.fire_cycle
            .triggered_job_complete(&bundle.trigger, &finished, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();

        assert!(!node.locks.is_held(&job.key).await.unwrap());
        assert_eq!(node.triggers.state(&TriggerKey::new("b", "g1")).await.unwrap(), Some(TriggerState::Waiting));
        let stored = node.jobs.get(&job.key).await.unwrap().unwrap();
        assert_eq!(stored.detail.job_data["runs"], json!(1));
    }

    #[tokio::test]
    async fn missing_calendar_skips_and_missing_job_fails() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_calendar("holidays", Calendar::new(), false, false).await.unwrap();
        node.persister
            .store_trigger(every_minute("cal", &job.key).with_calendar("holidays"), false)
            .await
            .unwrap();
        node.persister.store_trigger(every_minute("plain", &job.key), false).await.unwrap();

        let acquired = node.acquirer.acquire_next(t0(), 5, Duration::ZERO).await.unwrap();
        assert_eq!(acquired.len(), 2);
        node.triggers.remove(&TriggerKey::new("cal", "g1")).await.unwrap();
        node.persister.remove_calendar("holidays").await.unwrap();
        node.triggers.put(&acquired[0]).await.unwrap();
        node.triggers.put(&acquired[1]).await.unwrap();
        node.jobs.remove(&job.key).await.unwrap();

        let results = node.fire_cycle.triggers_fired(&acquired).await;
        let by_name = |name: &str| {
            acquired
                .iter()
                .position(|t| t.key.name() == name)
                .map(|i| &results[i])
                .unwrap()
        };
        assert!(matches!(by_name("cal"), TriggerFiredResult::Skipped));
        assert!(matches!(by_name("plain"), TriggerFiredResult::Failed(PersistenceError::JobNotFound(_))));
        assert!(node.locks.find_owned("node-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_instructions_set_states() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(every_minute("a", &job.key), false).await.unwrap();
        node.persister.store_trigger(every_minute("b", &job.key), false).await.unwrap();
        let record = node.jobs.get(&job.key).await.unwrap().unwrap();
        let a = node.triggers.get(&TriggerKey::new("a", "g1")).await.unwrap().unwrap();

        node.fire_cycle
            .triggered_job_complete(&a, &record, CompletedExecutionInstruction::SetTriggerError)
            .await
            .unwrap();
        assert_eq!(node.triggers.state(&a.key).await.unwrap(), Some(TriggerState::Error));

        node.fire_cycle
            .triggered_job_complete(&a, &record, CompletedExecutionInstruction::SetAllJobTriggersComplete)
            .await
            .unwrap();
        assert_eq!(node.triggers.state(&a.key).await.unwrap(), Some(TriggerState::Complete));
        assert_eq!(
            node.triggers.state(&TriggerKey::new("b", "g1")).await.unwrap(),
            Some(TriggerState::Complete)
        );
    }
}
