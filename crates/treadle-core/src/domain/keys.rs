//! Job / trigger keys and group matching.
//!
//! `Key<T>` は ids.rs と同じ Phantom type パターンで JobKey と TriggerKey を区別します。
//! キーは `(name, group)` の組で、ストア上の行キーとロック種別もここから導出します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

use super::lease::LockType;

/// Group used when a key is created without one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Group that holds synthesized recovery triggers.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";

/// Separator between group and name in storage keys.
const STORAGE_SEPARATOR: char = '\u{1f}';

/// KeyMarker ties a key kind to the lease type that guards it.
pub trait KeyMarker: Send + Sync + 'static {
    fn lock_type() -> LockType;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key<T: KeyMarker> {
    group: String,
    name: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: KeyMarker> Key<T> {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn in_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Row key used in the jobs / triggers tables.
    pub fn storage_key(&self) -> String {
        storage_key(&self.group, &self.name)
    }
}

impl<T: KeyMarker> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

pub(crate) fn storage_key(group: &str, name: &str) -> String {
    format!("{group}{STORAGE_SEPARATOR}{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {}

impl KeyMarker for JobKind {
    fn lock_type() -> LockType {
        LockType::Job
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TriggerKind {}

impl KeyMarker for TriggerKind {
    fn lock_type() -> LockType {
        LockType::Trigger
    }
}

pub type JobKey = Key<JobKind>;
pub type TriggerKey = Key<TriggerKind>;

/// Selects groups by name for the bulk pause / resume / listing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMatcher {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Anything,
}

impl GroupMatcher {
    pub fn equals(group: impl Into<String>) -> Self {
        Self::Equals(group.into())
    }

    pub fn matches(&self, group: &str) -> bool {
        match self {
            GroupMatcher::Equals(value) => group == value,
            GroupMatcher::StartsWith(value) => group.starts_with(value.as_str()),
            GroupMatcher::EndsWith(value) => group.ends_with(value.as_str()),
            GroupMatcher::Contains(value) => group.contains(value.as_str()),
            GroupMatcher::Anything => true,
        }
    }
}
