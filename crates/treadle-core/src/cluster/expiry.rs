//! ExpiryPolicy - リースの失効判定
//!
//! - 年齢が timeout 以上のリースは失効（ちょうど timeout のものも回収可能）
//! - trigger リースは所有ノードが defunct なら年齢に関係なく回収可能
//! - 自ノードのリースは liveness では判定しない
//! - liveness 行が無い所有者の扱いは `MissingLivenessPolicy` で決める

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;

use super::liveness::LivenessRegistry;
use crate::config::MissingLivenessPolicy;
use crate::domain::{Lease, LockType, PersistenceError};
use crate::ports::{Clock, to_delta};

#[derive(Clone)]
pub struct ExpiryPolicy {
    clock: Arc<dyn Clock>,
    liveness: LivenessRegistry,
    job_timeout: TimeDelta,
    trigger_timeout: TimeDelta,
    missing_liveness: MissingLivenessPolicy,
}

impl ExpiryPolicy {
    pub fn new(
        clock: Arc<dyn Clock>,
        liveness: LivenessRegistry,
        job_timeout: Duration,
        trigger_timeout: Duration,
        missing_liveness: MissingLivenessPolicy,
    ) -> Self {
        Self {
            clock,
            liveness,
            job_timeout: to_delta(job_timeout),
            trigger_timeout: to_delta(trigger_timeout),
            missing_liveness,
        }
    }

    pub fn timeout_for(&self, lock_type: LockType) -> TimeDelta {
        match lock_type {
            LockType::Job => self.job_timeout,
            LockType::Trigger => self.trigger_timeout,
        }
    }

    /// Age-only check.
    pub fn is_expired(&self, lease: &Lease) -> bool {
        lease.age(self.clock.now()) >= self.timeout_for(lease.lock_type)
    }

    /// Whether the owner of a lease stopped checking in.
    pub async fn owner_is_defunct(&self, owner: &str) -> Result<bool, PersistenceError> {
        if self.liveness.is_self(owner) {
            return Ok(false);
        }
        match self.liveness.find_instance(owner).await? {
            Some(record) => Ok(self.liveness.is_defunct(&record)),
            None => Ok(self.missing_liveness == MissingLivenessPolicy::TreatAsDefunct),
        }
    }

    pub async fn is_reclaimable(&self, lease: &Lease) -> Result<bool, PersistenceError> {
        if self.is_expired(lease) {
            return Ok(true);
        }
        match lease.lock_type {
            LockType::Job => Ok(false),
            LockType::Trigger => self.owner_is_defunct(&lease.owner).await,
        }
    }
}
