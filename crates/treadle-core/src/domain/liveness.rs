//! Liveness rows written by each node's check-in loop.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub scheduler_name: String,
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: u64,
}

impl LivenessRecord {
    pub fn storage_key(scheduler_name: &str, instance_id: &str) -> String {
        format!("{scheduler_name}/{instance_id}")
    }

    /// A node is defunct once `now - last_checkin > multiplier × interval`.
    pub fn is_defunct(&self, now: DateTime<Utc>, multiplier: u32) -> bool {
        let allowed = self.checkin_interval_ms.saturating_mul(u64::from(multiplier));
        let allowed = TimeDelta::milliseconds(i64::try_from(allowed).unwrap_or(i64::MAX / 1_000_000));
        now - self.last_checkin > allowed
    }
}
