//! Recoverer - 停止したノードが残したリースの回収
//!
//! # フロー
//! 1. 回収可能な trigger リース（または起動前の自ノードの残骸）を条件付きで奪う
//!    - ACQUIRED のトリガーは WAITING に戻す
//!    - ACQUIRED か executing 印付き（発火済みで未完了）のトリガーで、ジョブが
//!      recovery を要求していれば、一度だけ発火する recovery トリガーを作る
//!    - それ以外（発火前に pause された等）は失われた実行が無いので作らない
//! 2. 回収可能な job リース: recovery 要求があり未完了トリガーが無ければ recovery
//!    トリガーを合成し、BLOCKED のトリガーを WAITING に戻す
//! 3. 奪ったリースを解放する
//! 4. リースの無い、次回発火時刻の無いトリガーを削除する（orphan cascade 付き）
//!
//! recovery トリガーのキーは元トリガーと失われた発火時刻から決まるので、
//! 何度実行しても重複しません（insert-if-absent）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use super::lease_lock::LeaseLock;
use super::liveness::LivenessRegistry;
use crate::app::{MisfirePolicy, Persister};
use crate::dao::{CalendarDao, JobDao, TriggerLedger};
use crate::domain::{
    JobData, JobKey, JobRecord, Lease, LockType, MisfireInstruction, PersistenceError, RECOVERY_GROUP, Schedule,
    TriggerKey, TriggerRecord, TriggerState, merge_job_data,
};
use crate::ports::Clock;

/// Job data entries stamped on recovery triggers.
pub const RECOVERY_ORIGINAL_TRIGGER_NAME: &str = "recovery.original_trigger_name";
pub const RECOVERY_ORIGINAL_TRIGGER_GROUP: &str = "recovery.original_trigger_group";
pub const RECOVERY_ORIGINAL_FIRE_TIME_MS: &str = "recovery.original_fire_time_ms";
pub const RECOVERY_FAILED_INSTANCE: &str = "recovery.failed_instance";

/// Counts of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reclaimed_triggers: usize,
    pub reclaimed_jobs: usize,
    pub recovery_triggers: Vec<TriggerKey>,
    pub removed_exhausted: usize,
    pub failures: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Builds the one-shot triggers that re-run interrupted jobs.
pub struct RecoveryTriggerFactory;

impl RecoveryTriggerFactory {
    /// Recovery trigger for a fire of `original` lost at `lost_fire`.
    pub fn for_trigger(
        original: &TriggerRecord,
        job: &JobRecord,
        lost_fire: Option<DateTime<Utc>>,
        failed_instance: &str,
        now: DateTime<Utc>,
    ) -> TriggerRecord {
        let lost_ms = lost_fire.map_or(0, |at| at.timestamp_millis());
        let key = TriggerKey::new(
            format!("recover_{}_{}_{}", original.key.group(), original.key.name(), lost_ms),
            RECOVERY_GROUP,
        );
        let mut data = merge_job_data(&job.detail.job_data, &original.job_data);
        stamp(&mut data, original.key.name(), original.key.group(), lost_ms, failed_instance);
        TriggerRecord::new(key, original.job_key.clone(), Schedule::one_shot(), now)
            .with_priority(original.priority)
            .with_misfire_instruction(MisfireInstruction::IgnoreMisfires)
            .with_job_data(data)
            .with_description(format!("recovery of {}", original.key))
    }

    /// Recovery trigger for a job whose lease was lost with no trigger left.
    pub fn for_job(job: &JobRecord, lost_at: DateTime<Utc>, failed_instance: &str, now: DateTime<Utc>) -> TriggerRecord {
        let job_key = job.key();
        let lost_ms = lost_at.timestamp_millis();
        let key = TriggerKey::new(
            format!("recover_job_{}_{}_{}", job_key.group(), job_key.name(), lost_ms),
            RECOVERY_GROUP,
        );
        let mut data = job.detail.job_data.clone();
        stamp(&mut data, job_key.name(), job_key.group(), lost_ms, failed_instance);
        TriggerRecord::new(key, job_key.clone(), Schedule::one_shot(), now)
            .with_misfire_instruction(MisfireInstruction::IgnoreMisfires)
            .with_job_data(data)
            .with_description(format!("recovery of job {job_key}"))
    }
}

fn stamp(data: &mut JobData, name: &str, group: &str, lost_ms: i64, failed_instance: &str) {
    data.insert(RECOVERY_ORIGINAL_TRIGGER_NAME.into(), json!(name));
    data.insert(RECOVERY_ORIGINAL_TRIGGER_GROUP.into(), json!(group));
    data.insert(RECOVERY_ORIGINAL_FIRE_TIME_MS.into(), json!(lost_ms));
    data.insert(RECOVERY_FAILED_INSTANCE.into(), json!(failed_instance));
}

#[derive(Clone)]
pub struct Recoverer {
    clock: Arc<dyn Clock>,
    locks: LeaseLock,
    liveness: LivenessRegistry,
    jobs: JobDao,
    triggers: TriggerLedger,
    calendars: CalendarDao,
    misfire: MisfirePolicy,
    persister: Persister,
    started_at: DateTime<Utc>,
}

impl Recoverer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        locks: LeaseLock,
        liveness: LivenessRegistry,
        jobs: JobDao,
        triggers: TriggerLedger,
        calendars: CalendarDao,
        misfire: MisfirePolicy,
        persister: Persister,
    ) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            locks,
            liveness,
            jobs,
            triggers,
            calendars,
            misfire,
            persister,
            started_at,
        }
    }

    /// One full recovery pass. Per-row failures are logged and counted.
    pub async fn recover(&self) -> Result<RecoveryReport, PersistenceError> {
        let mut report = RecoveryReport::default();

        for (lease, version) in self.locks.find_all(LockType::Trigger).await? {
            match self.recover_trigger_lease(&lease, version, &mut report).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(lease = %lease.storage_key(), owner = %lease.owner, error = %err, "trigger lease recovery failed");
                    report.failures += 1;
                }
            }
        }

        for (lease, version) in self.locks.find_all(LockType::Job).await? {
            match self.recover_job_lease(&lease, version, &mut report).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(lease = %lease.storage_key(), owner = %lease.owner, error = %err, "job lease recovery failed");
                    report.failures += 1;
                }
            }
        }

        for trigger in self.triggers.find_without_next_fire_time().await? {
            match self.remove_exhausted(&trigger).await {
                Ok(true) => report.removed_exhausted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(trigger = %trigger.key, error = %err, "could not remove exhausted trigger");
                    report.failures += 1;
                }
            }
        }

        self.forget_defunct_instances().await?;

        if !report.is_empty() {
            info!(
                reclaimed_triggers = report.reclaimed_triggers,
                reclaimed_jobs = report.reclaimed_jobs,
                recovery_triggers = report.recovery_triggers.len(),
                removed_exhausted = report.removed_exhausted,
                failures = report.failures,
                "recovery pass finished"
            );
        }
        Ok(report)
    }

    /// A lease is orphaned when a peer's lease is reclaimable, or when it is
    /// this node's own lease from before this process started or past its
    /// timeout.
    async fn is_orphaned(&self, lease: &Lease) -> Result<bool, PersistenceError> {
        if lease.owner == self.locks.owner() {
            return Ok(lease.acquired_at < self.started_at || self.locks.expiry().is_expired(lease));
        }
        self.locks.expiry().is_reclaimable(lease).await
    }

    async fn recover_trigger_lease(
        &self,
        lease: &Lease,
        version: u64,
        report: &mut RecoveryReport,
    ) -> Result<(), PersistenceError> {
        if !self.is_orphaned(lease).await? {
            return Ok(());
        }
        let Some(reclaimed) = self.locks.reclaim(lease, version).await? else {
            return Ok(());
        };
        report.reclaimed_triggers += 1;
        let result = self.recover_trigger(&lease.trigger_key(), &lease.owner).await;
        self.locks.release_lease(&reclaimed).await?;
        if let Some(recovery_key) = result? {
            report.recovery_triggers.push(recovery_key);
        }
        Ok(())
    }

    /// Repairs a trigger whose lease was lost, with the lease held by this
    /// node. Returns the key of a newly created recovery trigger.
    pub async fn recover_trigger(
        &self,
        key: &TriggerKey,
        failed_instance: &str,
    ) -> Result<Option<TriggerKey>, PersistenceError> {
        let Some((mut trigger, version)) = self.triggers.get_versioned(key).await? else {
            return Ok(None);
        };
        let was_acquired = trigger.state == TriggerState::Acquired;
        let interrupted = trigger.executing;

        let mut created = None;
        let mut recovery_exists = false;
        if (was_acquired || interrupted)
            && let Some(job) = self.jobs.get(&trigger.job_key).await?
            && job.detail.requests_recovery
        {
            let lost_fire = if was_acquired {
                trigger.next_fire_time
            } else {
                trigger.previous_fire_time
            };
            let recovery = RecoveryTriggerFactory::for_trigger(&trigger, &job, lost_fire, failed_instance, self.clock.now());
            recovery_exists = true;
            created = self.insert_recovery_trigger(recovery).await?;
        }

        if was_acquired {
            if recovery_exists {
                let calendar = self.calendars.for_trigger(trigger.calendar_name.as_deref()).await?;
                trigger.triggered(calendar.as_ref());
            }
            trigger.state = TriggerState::Waiting;
            trigger.fire_instance_id = None;
        }
        trigger.executing = false;

        if trigger.next_fire_time.is_none() {
            self.persister.remove_trigger(key).await?;
            debug!(trigger = %key, "removed exhausted trigger during recovery");
            return Ok(created);
        }
        self.misfire.apply_misfire_on_recovery(&mut trigger).await?;
        if !self.triggers.replace_if_version(&trigger, version).await? {
            debug!(trigger = %key, "trigger changed while recovering; leaving it as is");
        }
        Ok(created)
    }

    async fn insert_recovery_trigger(&self, recovery: TriggerRecord) -> Result<Option<TriggerKey>, PersistenceError> {
        let key = recovery.key.clone();
        match self.persister.store_trigger(recovery, false).await {
            Ok(_) => {
                info!(trigger = %key, "recovery trigger created");
                Ok(Some(key))
            }
            Err(PersistenceError::AlreadyExists { .. }) => {
                debug!(trigger = %key, "recovery trigger already present");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn recover_job_lease(
        &self,
        lease: &Lease,
        version: u64,
        report: &mut RecoveryReport,
    ) -> Result<(), PersistenceError> {
        if !self.is_orphaned(lease).await? {
            return Ok(());
        }
        let Some(reclaimed) = self.locks.reclaim(lease, version).await? else {
            return Ok(());
        };
        report.reclaimed_jobs += 1;
        let result = self.recover_job(&lease.job_key(), lease).await;
        self.locks.release_lease(&reclaimed).await?;
        if let Some(recovery_key) = result? {
            report.recovery_triggers.push(recovery_key);
        }
        Ok(())
    }

    async fn recover_job(&self, job_key: &JobKey, lost: &Lease) -> Result<Option<TriggerKey>, PersistenceError> {
        let mut created = None;
        if let Some(job) = self.jobs.get(job_key).await?
            && job.detail.requests_recovery
        {
            let triggers = self.triggers.find_by_job(job_key).await?;
            if triggers.iter().all(|trigger| trigger.state == TriggerState::Complete) {
                let recovery = RecoveryTriggerFactory::for_job(&job, lost.acquired_at, &lost.owner, self.clock.now());
                created = self.insert_recovery_trigger(recovery).await?;
            }
        }
        let unblocked = self
            .triggers
            .set_state_by_job(job_key, &[TriggerState::Blocked], TriggerState::Waiting)
            .await?;
        if unblocked > 0 {
            info!(job = %job_key, unblocked, "released triggers blocked by a lost job lease");
        }
        Ok(created)
    }

    async fn remove_exhausted(&self, trigger: &TriggerRecord) -> Result<bool, PersistenceError> {
        if trigger.state == TriggerState::Acquired || self.locks.is_held(&trigger.key).await? {
            return Ok(false);
        }
        self.persister.remove_trigger_without_next_fire_time(&trigger.key).await
    }

    /// Drops liveness rows of defunct peers that no longer own any lease.
    async fn forget_defunct_instances(&self) -> Result<(), PersistenceError> {
        for record in self.liveness.defunct_instances().await? {
            if self.locks.find_owned(&record.instance_id).await?.is_empty()
                && self.liveness.remove_instance(&record.instance_id).await?
            {
                info!(instance = %record.instance_id, "forgot defunct scheduler instance");
            }
        }
        Ok(())
    }
}
