//! StateManager - pause / resume / エラー状態のリセット
//!
//! ホストからの状態変更はリースを取らず、行バージョン条件付きの書き込みで行います。
//! - pause: WAITING / ACQUIRED / BLOCKED → PAUSED
//! - resume: PAUSED → misfire 補正後に WAITING（ジョブが実行中なら BLOCKED、
//!   発火予定がなければ COMPLETE）
//! - グループ単位の pause は paused_*_groups に記録され、後から保存される
//!   トリガーも PAUSED で始まる

use tracing::{debug, info};

use super::misfire::MisfirePolicy;
use super::persister::Persister;
use crate::cluster::LeaseLock;
use crate::dao::{JobDao, PausedGroups, TriggerLedger};
use crate::domain::{GroupMatcher, JobKey, PersistenceError, TriggerKey, TriggerState};

const MAX_RESUME_ATTEMPTS: usize = 3;

const PAUSABLE: [TriggerState; 3] = [TriggerState::Waiting, TriggerState::Acquired, TriggerState::Blocked];

#[derive(Clone)]
pub struct StateManager {
    jobs: JobDao,
    triggers: TriggerLedger,
    paused_trigger_groups: PausedGroups,
    paused_job_groups: PausedGroups,
    locks: LeaseLock,
    misfire: MisfirePolicy,
    persister: Persister,
}

impl StateManager {
    pub fn new(
        jobs: JobDao,
        triggers: TriggerLedger,
        paused_trigger_groups: PausedGroups,
        paused_job_groups: PausedGroups,
        locks: LeaseLock,
        misfire: MisfirePolicy,
        persister: Persister,
    ) -> Self {
        Self {
            jobs,
            triggers,
            paused_trigger_groups,
            paused_job_groups,
            locks,
            misfire,
            persister,
        }
    }

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        let paused = self.triggers.transition(key, &PAUSABLE, TriggerState::Paused).await?;
        if paused {
            debug!(trigger = %key, "trigger paused");
        }
        Ok(paused)
    }

    /// Pauses every trigger in the matching groups and records the groups.
    /// An exact group name is recorded even when it has no triggers yet.
    pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        let groups = matching(matcher, self.triggers.group_names().await?);
        self.paused_trigger_groups.pause_all(&groups).await?;
        for trigger in self.triggers.find_in_groups(matcher).await? {
            self.pause_trigger(&trigger.key).await?;
        }
        info!(groups = ?groups, "trigger groups paused");
        Ok(groups)
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<(), PersistenceError> {
        for trigger in self.triggers.find_by_job(key).await? {
            self.pause_trigger(&trigger.key).await?;
        }
        Ok(())
    }

    pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        let groups = matching(matcher, self.jobs.group_names().await?);
        self.paused_job_groups.pause_all(&groups).await?;
        for job_key in self.jobs.keys_matching(matcher).await? {
            self.pause_job(&job_key).await?;
        }
        info!(groups = ?groups, "job groups paused");
        Ok(groups)
    }

    pub async fn pause_all(&self) -> Result<(), PersistenceError> {
        self.pause_triggers(&GroupMatcher::Anything).await?;
        Ok(())
    }

    /// PAUSED → WAITING / BLOCKED / COMPLETE, correcting a missed fire time first.
    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        for _ in 0..MAX_RESUME_ATTEMPTS {
            let Some((mut trigger, version)) = self.triggers.get_versioned(key).await? else {
                return Ok(false);
            };
            if trigger.state != TriggerState::Paused {
                return Ok(false);
            }
            self.misfire.apply_misfire(&mut trigger).await?;
            trigger.state = if trigger.next_fire_time.is_none() {
                TriggerState::Complete
            } else if self.job_is_running(&trigger.job_key).await? {
                TriggerState::Blocked
            } else {
                TriggerState::Waiting
            };
            trigger.fire_instance_id = None;
            if self.triggers.replace_if_version(&trigger, version).await? {
                debug!(trigger = %key, state = ?trigger.state, "trigger resumed");
                return Ok(true);
            }
        }
        debug!(trigger = %key, "giving up on resume after repeated conflicts");
        Ok(false)
    }

    async fn job_is_running(&self, job_key: &JobKey) -> Result<bool, PersistenceError> {
        let Some(job) = self.jobs.get(job_key).await? else {
            return Ok(false);
        };
        if !self.persister.descriptor(&job)?.disallow_concurrent_execution {
            return Ok(false);
        }
        self.locks.is_held(job_key).await
    }

    pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        let mut groups = matching(matcher, self.triggers.group_names().await?);
        for paused in self.paused_trigger_groups.all().await? {
            if matcher.matches(&paused) && !groups.contains(&paused) {
                groups.push(paused);
            }
        }
        for group in &groups {
            self.paused_trigger_groups.resume(group).await?;
        }
        for trigger in self.triggers.find_in_groups(matcher).await? {
            self.resume_trigger(&trigger.key).await?;
        }
        info!(groups = ?groups, "trigger groups resumed");
        Ok(groups)
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<(), PersistenceError> {
        for trigger in self.triggers.find_by_job(key).await? {
            self.resume_trigger(&trigger.key).await?;
        }
        Ok(())
    }

    pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, PersistenceError> {
        let mut groups = matching(matcher, self.jobs.group_names().await?);
        for paused in self.paused_job_groups.all().await? {
            if matcher.matches(&paused) && !groups.contains(&paused) {
                groups.push(paused);
            }
        }
        for group in &groups {
            self.paused_job_groups.resume(group).await?;
        }
        for job_key in self.jobs.keys_matching(matcher).await? {
            self.resume_job(&job_key).await?;
        }
        info!(groups = ?groups, "job groups resumed");
        Ok(groups)
    }

    pub async fn resume_all(&self) -> Result<(), PersistenceError> {
        self.resume_triggers(&GroupMatcher::Anything).await?;
        self.paused_trigger_groups.clear().await?;
        Ok(())
    }

    pub async fn paused_trigger_groups(&self) -> Result<Vec<String>, PersistenceError> {
        let mut groups = self.paused_trigger_groups.all().await?;
        groups.sort();
        Ok(groups)
    }

    pub async fn paused_job_groups(&self) -> Result<Vec<String>, PersistenceError> {
        let mut groups = self.paused_job_groups.all().await?;
        groups.sort();
        Ok(groups)
    }

    /// ERROR → WAITING, or PAUSED when the trigger's group is paused.
    pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<bool, PersistenceError> {
        let target = if self.paused_trigger_groups.is_paused(key.group()).await? {
            TriggerState::Paused
        } else {
            TriggerState::Waiting
        };
        let reset = self.triggers.transition(key, &[TriggerState::Error], target).await?;
        if reset {
            info!(trigger = %key, state = ?target, "trigger reset from error state");
        }
        Ok(reset)
    }
}

/// Groups the matcher selects out of `existing`; an exact name is always included.
fn matching(matcher: &GroupMatcher, existing: Vec<String>) -> Vec<String> {
    let mut groups: Vec<String> = existing.into_iter().filter(|group| matcher.matches(group)).collect();
    if let GroupMatcher::Equals(group) = matcher
        && !groups.contains(group)
    {
        groups.push(group.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::fixture::{self, exclusive_job, report_job, t0, trigger_for};
    use crate::domain::{Schedule, TriggerRecord};
    use crate::ports::Clock;
    use chrono::TimeDelta;
    use std::time::Duration;

    #[tokio::test]
    async fn paused_group_applies_to_triggers_stored_later() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();

        let groups = node.state_manager.pause_triggers(&GroupMatcher::equals("g1")).await.unwrap();
        assert_eq!(groups, vec!["g1".to_string()]);

        let stored = node.persister.store_trigger(trigger_for("t1", &job.key, t0()), false).await.unwrap();
        assert_eq!(stored.state, TriggerState::Paused);
        assert_eq!(node.state_manager.paused_trigger_groups().await.unwrap(), vec!["g1".to_string()]);

        node.state_manager.resume_triggers(&GroupMatcher::equals("g1")).await.unwrap();
        assert_eq!(node.triggers.state(&stored.key).await.unwrap(), Some(TriggerState::Waiting));
        assert!(node.state_manager.paused_trigger_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_applies_misfire_correction() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        let every_minute = TriggerRecord::new(
            TriggerKey::new("t1", "g1"),
            job.key.clone(),
            Schedule::repeat_forever(Duration::from_secs(60)),
            t0(),
        );
        node.persister.store_trigger(every_minute, false).await.unwrap();
        node.state_manager.pause_trigger(&TriggerKey::new("t1", "g1")).await.unwrap();

        node.clock.advance(Duration::from_secs(150));
        assert!(node.state_manager.resume_trigger(&TriggerKey::new("t1", "g1")).await.unwrap());

        let resumed = node.triggers.get(&TriggerKey::new("t1", "g1")).await.unwrap().unwrap();
        assert_eq!(resumed.state, TriggerState::Waiting);
        assert!(resumed.next_fire_time.unwrap() >= node.clock.now());
        assert_eq!(resumed.next_fire_time, Some(t0() + TimeDelta::seconds(180)));
    }

    #[tokio::test]
    async fn resume_keeps_trigger_blocked_while_its_job_runs() {
        let node = fixture::single_node();
        let job = exclusive_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(trigger_for("t1", &job.key, t0()), false).await.unwrap();
        node.state_manager.pause_job(&job.key).await.unwrap();

        assert!(node.locks.acquire(&job.key).await.unwrap());
        node.state_manager.resume_job(&job.key).await.unwrap();
        assert_eq!(
            node.triggers.state(&TriggerKey::new("t1", "g1")).await.unwrap(),
            Some(TriggerState::Blocked)
        );
    }

    #[tokio::test]
    async fn job_group_pause_and_resume() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(trigger_for("t1", &job.key, t0()), false).await.unwrap();

        let groups = node.state_manager.pause_jobs(&GroupMatcher::StartsWith("g".into())).await.unwrap();
        assert_eq!(groups, vec!["g1".to_string()]);
        assert_eq!(node.state_manager.paused_job_groups().await.unwrap(), vec!["g1".to_string()]);
        assert!(node.state_manager.paused_trigger_groups().await.unwrap().is_empty());
        assert_eq!(node.triggers.state(&TriggerKey::new("t1", "g1")).await.unwrap(), Some(TriggerState::Paused));

        let later = node.persister.store_trigger(trigger_for("t2", &job.key, t0()), false).await.unwrap();
        assert_eq!(later.state, TriggerState::Paused);

        node.state_manager.resume_jobs(&GroupMatcher::Anything).await.unwrap();
        assert!(node.state_manager.paused_job_groups().await.unwrap().is_empty());
        assert_eq!(node.triggers.state(&TriggerKey::new("t1", "g1")).await.unwrap(), Some(TriggerState::Waiting));
        assert_eq!(node.triggers.state(&TriggerKey::new("t2", "g1")).await.unwrap(), Some(TriggerState::Waiting));
    }

    #[tokio::test]
    async fn error_state_resets_to_paused_in_a_paused_group() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        let key = node.persister.store_trigger(trigger_for("t1", &job.key, t0()), false).await.unwrap().key;

        node.triggers.transition(&key, &[TriggerState::Waiting], TriggerState::Error).await.unwrap();
        assert!(node.state_manager.reset_trigger_from_error_state(&key).await.unwrap());
        assert_eq!(node.triggers.state(&key).await.unwrap(), Some(TriggerState::Waiting));

        node.triggers.transition(&key, &[TriggerState::Waiting], TriggerState::Error).await.unwrap();
        node.state_manager.pause_triggers(&GroupMatcher::equals("g1")).await.unwrap();
        assert!(node.state_manager.reset_trigger_from_error_state(&key).await.unwrap());
        assert_eq!(node.triggers.state(&key).await.unwrap(), Some(TriggerState::Paused));

        assert!(!node.state_manager.reset_trigger_from_error_state(&key).await.unwrap());
    }

    #[tokio::test]
    async fn pause_all_and_resume_all() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(trigger_for("t1", &job.key, t0()), false).await.unwrap();

        node.state_manager.pause_all().await.unwrap();
        assert_eq!(node.triggers.state(&TriggerKey::new("t1", "g1")).await.unwrap(), Some(TriggerState::Paused));

        node.state_manager.resume_all().await.unwrap();
        assert_eq!(node.triggers.state(&TriggerKey::new("t1", "g1")).await.unwrap(), Some(TriggerState::Waiting));
        assert!(node.state_manager.paused_trigger_groups().await.unwrap().is_empty());
    }
}
