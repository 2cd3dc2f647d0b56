//! Lease rows: one per locked job or trigger.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::keys::{JobKey, Key, KeyMarker, TriggerKey, storage_key};

/// Kind of resource a lease guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Job,
    Trigger,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Job => "job",
            LockType::Trigger => "trigger",
        }
    }
}

/// A lease row. Existence of the row means the resource is locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lock_type: LockType,
    pub group: String,
    pub name: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn new<T: KeyMarker>(key: &Key<T>, owner: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            lock_type: T::lock_type(),
            group: key.group().to_string(),
            name: key.name().to_string(),
            owner: owner.into(),
            acquired_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.acquired_at
    }

    pub fn trigger_key(&self) -> TriggerKey {
        TriggerKey::new(self.name.clone(), self.group.clone())
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.name.clone(), self.group.clone())
    }

    pub fn storage_key(&self) -> String {
        lease_storage_key(self.lock_type, &self.group, &self.name)
    }
}

/// Row key of the lease guarding `key`.
pub fn lease_key<T: KeyMarker>(key: &Key<T>) -> String {
    lease_storage_key(T::lock_type(), key.group(), key.name())
}

fn lease_storage_key(lock_type: LockType, group: &str, name: &str) -> String {
    format!("{}/{}", lock_type.as_str(), storage_key(group, name))
}
