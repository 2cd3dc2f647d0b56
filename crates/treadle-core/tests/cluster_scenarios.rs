//! Multi-node scenarios against one shared in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::json;

use treadle_core::cluster::LoggingCheckinHandler;
use treadle_core::domain::{
    CompletedExecutionInstruction, JobDetail, JobKey, MisfireInstruction, RECOVERY_GROUP, Schedule, TriggerKey,
    TriggerRecord, TriggerState,
};
use treadle_core::impls::InMemoryStore;
use treadle_core::ports::{Clock, FixedClock, Store};
use treadle_core::typed::JobKind;
use treadle_core::{JobStore, JobStoreBuilder, StoreConfig, TriggerFiredResult};

struct Report;

impl JobKind for Report {
    const TYPE: &'static str = "it.report.v1";
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

struct Cluster {
    store: Arc<dyn Store>,
    clock: Arc<FixedClock>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(FixedClock::new(t0())),
        }
    }

    fn node(&self, instance_id: &str) -> JobStore {
        self.node_with(StoreConfig::new(instance_id))
    }

    fn node_with(&self, config: StoreConfig) -> JobStore {
        JobStoreBuilder::new(config)
            .store(self.store.clone())
            .clock(self.clock.clone())
            .checkin_error_handler(Arc::new(LoggingCheckinHandler::default()))
            .register_job_type::<Report>()
            .unwrap()
            .build()
            .unwrap()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::new(name, "reports"), Report::TYPE)
}

fn one_shot(name: &str, job: &JobKey, at: DateTime<Utc>) -> TriggerRecord {
    TriggerRecord::new(TriggerKey::new(name, "g1"), job.clone(), Schedule::one_shot(), at)
}

fn every_minute(name: &str, job: &JobKey, start: DateTime<Utc>) -> TriggerRecord {
    TriggerRecord::new(
        TriggerKey::new(name, "g1"),
        job.clone(),
        Schedule::repeat_forever(Duration::from_secs(60)),
        start,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_nodes_acquire_disjoint_triggers() {
    let cluster = Cluster::new();
    let a = Arc::new(cluster.node("node-a"));
    let b = Arc::new(cluster.node("node-b"));

    let detail = job("nightly");
    a.store_job(detail.clone(), false).await.unwrap();
    for i in 0..20 {
        a.store_trigger(one_shot(&format!("t{i}"), &detail.key, t0()), false)
            .await
            .unwrap();
    }

    let now = cluster.now();
    let race = |node: Arc<JobStore>| tokio::spawn(async move { node.acquire_next_triggers(now, 20, Duration::ZERO).await });
    let (from_a, from_b) = (race(a.clone()), race(b.clone()));
    let from_a = from_a.await.unwrap().unwrap();
    let from_b = from_b.await.unwrap().unwrap();

    let keys_a: HashSet<_> = from_a.iter().map(|t| t.key.clone()).collect();
    let keys_b: HashSet<_> = from_b.iter().map(|t| t.key.clone()).collect();
    assert!(keys_a.is_disjoint(&keys_b));
    assert_eq!(keys_a.len() + keys_b.len(), 20);
}

#[tokio::test]
async fn crashed_node_work_is_recovered_with_merged_job_data() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let detail = job("invoice").requests_recovery(true).with_data("tenant", "acme");
    let mut trigger = one_shot("t1", &detail.key, t0());
    trigger.job_data.insert("batch".into(), json!(42));
    a.store_job_and_trigger(detail.clone(), trigger).await.unwrap();

    a.check_in().await.unwrap();
    let acquired = a.acquire_next_triggers(cluster.now(), 1, Duration::ZERO).await.unwrap();
    assert_eq!(acquired.len(), 1);

    // node-a stops checking in
    cluster.clock.advance(Duration::from_secs(30));
    b.check_in().await.unwrap();
    let report = b.recover_now().await.unwrap();
    assert_eq!(report.reclaimed_triggers, 1);
    assert_eq!(report.recovery_triggers.len(), 1);

    let recovery = b.retrieve_trigger(&report.recovery_triggers[0]).await.unwrap().unwrap();
    assert_eq!(recovery.key.group(), RECOVERY_GROUP);
    assert_eq!(recovery.job_data["tenant"], json!("acme"));
    assert_eq!(recovery.job_data["batch"], json!(42));
    assert!(!b.check_trigger_exists(&TriggerKey::new("t1", "g1")).await.unwrap());

    let acquired = b.acquire_next_triggers(cluster.now(), 5, Duration::ZERO).await.unwrap();
    assert_eq!(acquired.len(), 1);
    let fired = b.triggers_fired(&acquired).await;
    let TriggerFiredResult::Fired(bundle) = &fired[0] else {
        panic!("recovery trigger did not fire");
    };
    assert!(bundle.recovering);
    assert_eq!(bundle.job.key(), &detail.key);
    b.triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::DeleteTrigger)
        .await
        .unwrap();
    assert_eq!(b.number_of_triggers().await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_recovery_creates_no_duplicates() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let detail = job("ledger").requests_recovery(true);
    a.store_job_and_trigger(detail.clone(), every_minute("t1", &detail.key, t0()))
        .await
        .unwrap();
    a.check_in().await.unwrap();
    a.acquire_next_triggers(cluster.now(), 1, Duration::ZERO).await.unwrap();

    cluster.clock.advance(Duration::from_secs(30));
    let first = b.recover_now().await.unwrap();
    let second = b.recover_now().await.unwrap();

    assert_eq!(first.recovery_triggers.len(), 1);
    assert!(second.recovery_triggers.is_empty());
    assert_eq!(second.reclaimed_triggers, 0);
    assert_eq!(b.number_of_triggers().await.unwrap(), 2);
    assert_eq!(
        b.trigger_state(&TriggerKey::new("t1", "g1")).await.unwrap(),
        Some(TriggerState::Waiting)
    );
}

#[tokio::test]
async fn lease_expiry_is_monotonic_in_age() {
    let cluster = Cluster::new();
    let config = |id: &str| StoreConfig::new(id).with_trigger_timeout(Duration::from_secs(60));
    let a = cluster.node_with(config("node-a"));
    let b = cluster.node_with(config("node-b"));

    let detail = job("sync").durable(true);
    a.store_job_and_trigger(detail.clone(), every_minute("t1", &detail.key, t0()))
        .await
        .unwrap();
    // node-a never checks in, so only age can expire its lease
    a.acquire_next_triggers(cluster.now(), 1, Duration::ZERO).await.unwrap();

    cluster.clock.advance(Duration::from_millis(59_999));
    assert_eq!(b.recover_now().await.unwrap().reclaimed_triggers, 0);
    assert_eq!(
        b.trigger_state(&TriggerKey::new("t1", "g1")).await.unwrap(),
        Some(TriggerState::Acquired)
    );

    cluster.clock.advance(Duration::from_millis(1));
    assert_eq!(b.recover_now().await.unwrap().reclaimed_triggers, 1);
    let recovered = b.retrieve_trigger(&TriggerKey::new("t1", "g1")).await.unwrap().unwrap();
    assert_eq!(recovered.state, TriggerState::Waiting);
    assert!(recovered.next_fire_time.unwrap() > cluster.now());
}

#[tokio::test]
async fn defunct_owner_loses_even_a_young_trigger_lease() {
    let cluster = Cluster::new();
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let detail = job("sync").durable(true);
    a.store_job_and_trigger(detail.clone(), every_minute("t1", &detail.key, t0()))
        .await
        .unwrap();
    a.check_in().await.unwrap();
    a.acquire_next_triggers(cluster.now(), 1, Duration::ZERO).await.unwrap();

    // two check-in intervals of silence, far below the ten minute lease timeout
    cluster.clock.advance(Duration::from_secs(16));
    assert_eq!(b.recover_now().await.unwrap().reclaimed_triggers, 1);
}

#[tokio::test]
async fn removing_the_last_trigger_removes_a_non_durable_job() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a");

    let solo = job("solo");
    node.store_job_and_trigger(solo.clone(), one_shot("only", &solo.key, t0()))
        .await
        .unwrap();
    assert!(node.remove_trigger(&TriggerKey::new("only", "g1")).await.unwrap());
    assert!(!node.check_job_exists(&solo.key).await.unwrap());

    let pair = job("pair");
    node.store_job_and_trigger(pair.clone(), one_shot("first", &pair.key, t0()))
        .await
        .unwrap();
    node.store_trigger(one_shot("second", &pair.key, t0()), false).await.unwrap();
    assert!(node.remove_trigger(&TriggerKey::new("first", "g1")).await.unwrap());
    assert!(node.check_job_exists(&pair.key).await.unwrap());
}

#[tokio::test]
async fn misfired_trigger_skips_to_its_next_fire_time() {
    let cluster = Cluster::new();
    let node = cluster.node_with(StoreConfig::new("node-a").with_misfire_threshold(Duration::from_millis(5_000)));

    let detail = job("late");
    let late = every_minute("t1", &detail.key, cluster.now() - TimeDelta::milliseconds(10_000))
        .with_misfire_instruction(MisfireInstruction::SkipToNext);
    node.store_job_and_trigger(detail, late).await.unwrap();

    let acquired = node.acquire_next_triggers(cluster.now(), 1, Duration::ZERO).await.unwrap();
    assert!(acquired.is_empty());
    let stored = node.retrieve_trigger(&TriggerKey::new("t1", "g1")).await.unwrap().unwrap();
    assert!(stored.next_fire_time.unwrap() > cluster.now());
    assert_eq!(stored.state, TriggerState::Waiting);
}

#[tokio::test]
async fn higher_priority_wins_at_equal_fire_time() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a");

    let detail = job("ranked").durable(true);
    node.store_job(detail.clone(), false).await.unwrap();
    node.store_trigger(one_shot("low", &detail.key, t0()).with_priority(5), false)
        .await
        .unwrap();
    node.store_trigger(one_shot("high", &detail.key, t0()).with_priority(10), false)
        .await
        .unwrap();

    let acquired = node.acquire_next_triggers(cluster.now(), 1, Duration::ZERO).await.unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].key, TriggerKey::new("high", "g1"));
}
