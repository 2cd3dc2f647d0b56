//! Test wiring: nodes over an in-memory store with a manually driven clock.

use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use super::builder::{Components, JobStoreBuilder};
use crate::cluster::LoggingCheckinHandler;
use crate::config::StoreConfig;
use crate::domain::{JobDetail, JobKey, Schedule, TriggerKey, TriggerRecord};
use crate::impls::InMemoryStore;
use crate::ports::{FixedClock, Store};
use crate::typed::JobKind;
use crate::typed::test_kinds::{ExclusiveJob, ReportJob};

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// One node's components plus the clock driving them.
pub(crate) struct TestNode {
    components: Components,
    pub clock: Arc<FixedClock>,
}

impl Deref for TestNode {
    type Target = Components;

    fn deref(&self) -> &Components {
        &self.components
    }
}

pub(crate) fn single_node() -> TestNode {
    node_on(Arc::new(InMemoryStore::new()), Arc::new(FixedClock::new(t0())), "node-a")
}

pub(crate) fn node_on(store: Arc<dyn Store>, clock: Arc<FixedClock>, instance_id: &str) -> TestNode {
    let components = JobStoreBuilder::new(StoreConfig::new(instance_id))
        .store(store)
        .clock(clock.clone())
        .checkin_error_handler(Arc::new(LoggingCheckinHandler::default()))
        .register_job_type::<ReportJob>()
        .unwrap()
        .register_job_type::<ExclusiveJob>()
        .unwrap()
        .build_components()
        .unwrap();
    TestNode { components, clock }
}

pub(crate) fn report_job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::new(name, "g1"), ReportJob::TYPE)
}

pub(crate) fn exclusive_job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::new(name, "g1"), ExclusiveJob::TYPE)
}

/// One-shot trigger firing at `start`.
pub(crate) fn trigger_for(name: &str, job: &JobKey, start: DateTime<Utc>) -> TriggerRecord {
    TriggerRecord::new(TriggerKey::new(name, "g1"), job.clone(), Schedule::one_shot(), start)
}
