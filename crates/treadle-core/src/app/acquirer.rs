//! Acquirer - 次に発火するトリガーの取得
//!
//! # フロー
//! 1. `no_later_than + time_window` までに発火する WAITING トリガーを
//!    （発火時刻 昇順, 優先度 降順, キー）の順に並べる
//! 2. 各候補の trigger リースを取り、読み直して WAITING のままか確認する
//! 3. misfire を補正し、horizon より先に動いたら保存して見送る
//! 4. バージョン条件付きで ACQUIRED へ遷移し、新しい fire_instance_id を振る
//! 5. `max_count` に達したら終了
//!
//! リースに負けた候補は黙って飛ばします。失効したリースを奪った場合は、
//! 先に Recoverer で修復してから recovery トリガーを代わりに取得します。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::misfire::MisfirePolicy;
use super::persister::Persister;
use crate::cluster::{LeaseLock, LeaseOutcome, Recoverer};
use crate::dao::{JobDao, TriggerLedger};
use crate::domain::{JobKey, PersistenceError, TriggerKey, TriggerRecord, TriggerState};
use crate::ports::{IdGenerator, to_delta};

/// A trigger prepared for firing, and whether its job runs exclusively.
struct Prepared {
    trigger: TriggerRecord,
    exclusive: bool,
}

#[derive(Clone)]
pub struct Acquirer {
    ids: Arc<dyn IdGenerator>,
    jobs: JobDao,
    triggers: TriggerLedger,
    locks: LeaseLock,
    misfire: MisfirePolicy,
    persister: Persister,
    recoverer: Recoverer,
}

impl Acquirer {
    pub fn new(
        ids: Arc<dyn IdGenerator>,
        jobs: JobDao,
        triggers: TriggerLedger,
        locks: LeaseLock,
        misfire: MisfirePolicy,
        persister: Persister,
        recoverer: Recoverer,
    ) -> Self {
        Self {
            ids,
            jobs,
            triggers,
            locks,
            misfire,
            persister,
            recoverer,
        }
    }

    pub async fn acquire_next(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<TriggerRecord>, PersistenceError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let horizon = no_later_than + to_delta(time_window);
        let candidates = self.triggers.find_eligible(horizon).await?;

        let mut acquired = Vec::new();
        let mut exclusive_jobs: HashSet<JobKey> = HashSet::new();
        for candidate in candidates {
            if acquired.len() >= max_count {
                break;
            }
            if exclusive_jobs.contains(&candidate.job_key) {
                continue;
            }
            match self.acquire_trigger(&candidate.key, horizon).await {
                Ok(Some(prepared)) => {
                    if prepared.exclusive {
                        exclusive_jobs.insert(prepared.trigger.job_key.clone());
                    }
                    acquired.push(prepared.trigger);
                }
                Ok(None) => {}
                Err(err) if err.is_connectivity() => {
                    if acquired.is_empty() {
                        return Err(err);
                    }
                    warn!(trigger = %candidate.key, error = %err, "stopping acquisition early");
                    break;
                }
                Err(err) => {
                    warn!(trigger = %candidate.key, error = %err, "skipping trigger");
                }
            }
        }
        debug!(count = acquired.len(), horizon = %horizon, "acquired triggers");
        Ok(acquired)
    }

    async fn acquire_trigger(&self, key: &TriggerKey, horizon: DateTime<Utc>) -> Result<Option<Prepared>, PersistenceError> {
        match self.locks.try_acquire(key).await? {
            LeaseOutcome::Held => Ok(None),
            LeaseOutcome::Acquired(_) => self.prepare_or_release(key, horizon).await,
            LeaseOutcome::Reclaimed { previous, .. } => {
                debug!(trigger = %key, previous_owner = %previous.owner, "recovering trigger behind an expired lease");
                let recovered = self.recoverer.recover_trigger(key, &previous.owner).await;
                self.locks.release(key).await?;
                let Some(recovery_key) = recovered? else {
                    return Ok(None);
                };
                if !self.locks.acquire(&recovery_key).await? {
                    return Ok(None);
                }
                self.prepare_or_release(&recovery_key, horizon).await
            }
        }
    }

    /// Runs `prepare_for_fire` under the lease; the lease is released unless
    /// the trigger ends up ACQUIRED.
    async fn prepare_or_release(&self, key: &TriggerKey, horizon: DateTime<Utc>) -> Result<Option<Prepared>, PersistenceError> {
        let prepared = self.prepare_for_fire(key, horizon).await;
        if !matches!(prepared, Ok(Some(_))) {
            self.locks.release(key).await?;
        }
        prepared
    }

    async fn prepare_for_fire(&self, key: &TriggerKey, horizon: DateTime<Utc>) -> Result<Option<Prepared>, PersistenceError> {
        let Some((mut trigger, version)) = self.triggers.get_versioned(key).await? else {
            return Ok(None);
        };
        if trigger.state != TriggerState::Waiting {
            return Ok(None);
        }
        if trigger.next_fire_time.is_none() {
            self.persister.remove_trigger(key).await?;
            return Ok(None);
        }
        let Some(job) = self.jobs.get(&trigger.job_key).await? else {
            error!(trigger = %key, job = %trigger.job_key, "trigger refers to a missing job; removing it");
            self.persister.remove_trigger(key).await?;
            return Ok(None);
        };
        let exclusive = self.persister.descriptor(&job)?.disallow_concurrent_execution;

        if self.misfire.apply_misfire(&mut trigger).await? {
            match trigger.next_fire_time {
                None => {
                    self.persister.remove_trigger(key).await?;
                    return Ok(None);
                }
                Some(next) if next > horizon => {
                    self.triggers.replace_if_version(&trigger, version).await?;
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        trigger.state = TriggerState::Acquired;
        trigger.fire_instance_id = Some(self.ids.generate_fire_instance_id());
        if !self.triggers.replace_if_version(&trigger, version).await? {
            debug!(trigger = %key, "trigger changed before it could be acquired");
            return Ok(None);
        }
        Ok(Some(Prepared { trigger, exclusive }))
    }

    /// Hands an acquired trigger back: ACQUIRED -> WAITING, lease released.
    pub async fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<(), PersistenceError> {
        self.triggers
            .transition(key, &[TriggerState::Acquired], TriggerState::Waiting)
            .await?;
        self.locks.release(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::fixture::{self, exclusive_job, report_job, t0, trigger_for};
    use crate::domain::{MisfireInstruction, Schedule};
    use crate::impls::InMemoryStore;
    use crate::ports::{FixedClock, Store};
    use chrono::TimeDelta;

    #[tokio::test]
    async fn higher_priority_wins_at_equal_fire_time() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister
            .store_trigger(trigger_for("low", &job.key, t0()).with_priority(5), false)
            .await
            .unwrap();
        node.persister
            .store_trigger(trigger_for("high", &job.key, t0()).with_priority(10), false)
            .await
            .unwrap();

        let acquired = node.acquirer.acquire_next(t0(), 1, Duration::ZERO).await.unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].key.name(), "high");
        assert_eq!(acquired[0].state, TriggerState::Acquired);
        assert!(acquired[0].fire_instance_id.is_some());
        assert!(node.locks.is_held(&acquired[0].key).await.unwrap());
    }

    #[tokio::test]
    async fn time_window_extends_the_horizon() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister
            .store_trigger(trigger_for("soon", &job.key, t0() + TimeDelta::seconds(20)), false)
            .await
            .unwrap();

        assert!(node.acquirer.acquire_next(t0(), 5, Duration::ZERO).await.unwrap().is_empty());
        let acquired = node.acquirer.acquire_next(t0(), 5, Duration::from_secs(30)).await.unwrap();
        assert_eq!(acquired.len(), 1);
    }

    #[tokio::test]
    async fn two_nodes_never_acquire_the_same_trigger() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let a = fixture::node_on(store.clone(), clock.clone(), "node-a");
        let b = fixture::node_on(store, clock, "node-b");

        let job = report_job("j1");
        a.persister.store_job(job.clone(), false).await.unwrap();
        for i in 0..10 {
            a.persister
                .store_trigger(trigger_for(&format!("t{i}"), &job.key, t0()), false)
                .await
                .unwrap();
        }

        let (from_a, from_b) = tokio::join!(
            a.acquirer.acquire_next(t0(), 10, Duration::ZERO),
            b.acquirer.acquire_next(t0(), 10, Duration::ZERO),
        );
        let mut keys: Vec<_> = from_a.unwrap().into_iter().chain(from_b.unwrap()).map(|t| t.key).collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(total, 10);
        assert_eq!(keys.len(), 10);
    }

    #[tokio::test]
    async fn one_trigger_per_exclusive_job_per_batch() {
        let node = fixture::single_node();
        let job = exclusive_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(trigger_for("a", &job.key, t0()), false).await.unwrap();
        node.persister.store_trigger(trigger_for("b", &job.key, t0()), false).await.unwrap();

        let acquired = node.acquirer.acquire_next(t0(), 5, Duration::ZERO).await.unwrap();
        assert_eq!(acquired.len(), 1);
        assert!(!node.locks.is_held(&TriggerKey::new("b", "g1")).await.unwrap());
    }

    #[tokio::test]
    async fn misfired_trigger_skipped_past_the_horizon_is_not_returned() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        let late = TriggerRecord::new(
            TriggerKey::new("late", "g1"),
            job.key.clone(),
            Schedule::repeat_forever(Duration::from_secs(60)),
            t0() - TimeDelta::milliseconds(10_000),
        )
        .with_misfire_instruction(MisfireInstruction::SkipToNext);
        node.persister.store_trigger(late, false).await.unwrap();

        let acquired = node.acquirer.acquire_next(t0(), 1, Duration::ZERO).await.unwrap();
        assert!(acquired.is_empty());

        let stored = node.triggers.get(&TriggerKey::new("late", "g1")).await.unwrap().unwrap();
        assert_eq!(stored.state, TriggerState::Waiting);
        assert!(stored.next_fire_time.unwrap() > t0());
        assert!(!node.locks.is_held(&stored.key).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_and_orphaned_triggers_are_removed() {
        let node = fixture::single_node();
        let job = report_job("j1").durable(true);
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.triggers
            .put(&trigger_for("done", &job.key, t0()).with_next_fire_time(None))
            .await
            .unwrap();
        node.triggers
            .put(&trigger_for("orphan", &JobKey::new("ghost", "g1"), t0()))
            .await
            .unwrap();

        assert!(node.acquirer.acquire_next(t0(), 5, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(node.triggers.count().await.unwrap(), 0);
        assert!(node.locks.find_owned("node-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_trigger_can_be_acquired_again() {
        let node = fixture::single_node();
        let job = report_job("j1");
        node.persister.store_job(job.clone(), false).await.unwrap();
        node.persister.store_trigger(trigger_for("t1", &job.key, t0()), false).await.unwrap();

        let first = node.acquirer.acquire_next(t0(), 1, Duration::ZERO).await.unwrap();
        node.acquirer.release_acquired_trigger(&first[0].key).await.unwrap();
        let stored = node.triggers.get(&first[0].key).await.unwrap().unwrap();
        assert_eq!(stored.state, TriggerState::Waiting);
        assert!(stored.fire_instance_id.is_none());

        let second = node.acquirer.acquire_next(t0(), 1, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].fire_instance_id, first[0].fire_instance_id);
    }

    #[tokio::test]
    async fn connectivity_failure_surfaces_when_nothing_was_acquired() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let node = fixture::node_on(store.clone(), clock, "node-a");
        store.set_offline(true);

        let err = node.acquirer.acquire_next(t0(), 1, Duration::ZERO).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
