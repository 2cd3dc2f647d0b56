//! LeaseLock - locks テーブル上の分散ロック
//!
//! # 取得の手順
//! 1. 行が無ければ insert-if-absent で作る（Acquired）
//! 2. 行があり他ノードが所有していて ExpiryPolicy が回収可能と判断したら、
//!    読んだバージョンを条件に置き換える（Reclaimed）
//! 3. それ以外、または条件付き書き込みに負けたら Held（エラーではない）
//!
//! 解放は所有者を再確認し、バージョン付き削除で行います。
//! 他ノードに回収されたリースを誤って消すことはありません。

use std::sync::Arc;

use tracing::debug;

use super::expiry::ExpiryPolicy;
use crate::dao::cas::{CasOutcome, get_versioned, insert_record, replace_record, scan_versioned, update_record};
use crate::domain::keys::{Key, KeyMarker};
use crate::domain::lease::lease_key;
use crate::domain::{Lease, LockType, PersistenceError};
use crate::ports::{Clock, Row, Store, Table};

/// Result of `LeaseLock::try_acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// No lease existed; a fresh one was written.
    Acquired(Lease),
    /// An expired or orphaned lease was taken over.
    Reclaimed { lease: Lease, previous: Lease },
    /// Someone holds the lease (possibly this node), or the write lost a race.
    Held,
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, LeaseOutcome::Held)
    }

    pub fn was_reclaimed(&self) -> bool {
        matches!(self, LeaseOutcome::Reclaimed { .. })
    }
}

#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    expiry: ExpiryPolicy,
    owner: String,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, expiry: ExpiryPolicy, owner: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            expiry,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn expiry(&self) -> &ExpiryPolicy {
        &self.expiry
    }

    pub async fn try_acquire<T: KeyMarker>(&self, key: &Key<T>) -> Result<LeaseOutcome, PersistenceError> {
        let lease = Lease::new(key, self.owner.clone(), self.clock.now());
        if insert_record(self.store.as_ref(), &lease).await? {
            debug!(lease = %lease.storage_key(), owner = %self.owner, "lease acquired");
            return Ok(LeaseOutcome::Acquired(lease));
        }

        let Some((current, version)) = get_versioned::<Lease>(self.store.as_ref(), &lease_key(key)).await? else {
            // released between our insert and read; one more insert decides it
            if insert_record(self.store.as_ref(), &lease).await? {
                return Ok(LeaseOutcome::Acquired(lease));
            }
            return Ok(LeaseOutcome::Held);
        };
        if current.owner == self.owner || !self.expiry.is_reclaimable(&current).await? {
            return Ok(LeaseOutcome::Held);
        }
        match self.reclaim(&current, version).await? {
            Some(lease) => Ok(LeaseOutcome::Reclaimed { lease, previous: current }),
            None => Ok(LeaseOutcome::Held),
        }
    }

    pub async fn acquire<T: KeyMarker>(&self, key: &Key<T>) -> Result<bool, PersistenceError> {
        Ok(self.try_acquire(key).await?.is_acquired())
    }

    /// Takes over `current` if its row is still at `version`.
    pub async fn reclaim(&self, current: &Lease, version: u64) -> Result<Option<Lease>, PersistenceError> {
        let mut lease = current.clone();
        lease.owner = self.owner.clone();
        lease.acquired_at = self.clock.now();
        if replace_record(self.store.as_ref(), &lease, version).await? {
            debug!(
                lease = %lease.storage_key(),
                owner = %self.owner,
                previous_owner = %current.owner,
                "lease reclaimed"
            );
            Ok(Some(lease))
        } else {
            debug!(lease = %lease.storage_key(), "lost the race to reclaim lease");
            Ok(None)
        }
    }

    /// Resets `acquired_at`; false once the lease is no longer ours.
    pub async fn renew<T: KeyMarker>(&self, key: &Key<T>) -> Result<bool, PersistenceError> {
        let now = self.clock.now();
        let owner = self.owner.as_str();
        let outcome = update_record::<Lease, _>(self.store.as_ref(), &lease_key(key), |lease| {
            if lease.owner != owner {
                return false;
            }
            lease.acquired_at = now;
            true
        })
        .await?;
        Ok(matches!(outcome, CasOutcome::Applied(_)))
    }

    /// Deletes the lease only while this node still owns it.
    pub async fn release<T: KeyMarker>(&self, key: &Key<T>) -> Result<bool, PersistenceError> {
        self.release_row(&lease_key(key)).await
    }

    pub async fn release_lease(&self, lease: &Lease) -> Result<bool, PersistenceError> {
        self.release_row(&lease.storage_key()).await
    }

    async fn release_row(&self, storage_key: &str) -> Result<bool, PersistenceError> {
        let Some((current, version)) = get_versioned::<Lease>(self.store.as_ref(), storage_key).await? else {
            return Ok(false);
        };
        if current.owner != self.owner {
            debug!(lease = %storage_key, holder = %current.owner, "not releasing a lease held elsewhere");
            return Ok(false);
        }
        let released = self
            .store
            .compare_and_delete(Table::Locks, storage_key, version)
            .await?;
        if released {
            debug!(lease = %storage_key, owner = %self.owner, "lease released");
        }
        Ok(released)
    }

    pub async fn holder<T: KeyMarker>(&self, key: &Key<T>) -> Result<Option<Lease>, PersistenceError> {
        Ok(get_versioned::<Lease>(self.store.as_ref(), &lease_key(key))
            .await?
            .map(|(lease, _)| lease))
    }

    pub async fn is_held<T: KeyMarker>(&self, key: &Key<T>) -> Result<bool, PersistenceError> {
        Ok(self.store.get(Table::Locks, &lease_key(key)).await?.is_some())
    }

    pub async fn find_owned(&self, owner: &str) -> Result<Vec<Lease>, PersistenceError> {
        let filter = |row: &Row| row.value.get("owner").and_then(|v| v.as_str()) == Some(owner);
        let leases: Vec<(Lease, u64)> = scan_versioned(self.store.as_ref(), &filter).await?;
        Ok(leases.into_iter().map(|(lease, _)| lease).collect())
    }

    /// All leases of one type with their row versions.
    pub async fn find_all(&self, lock_type: LockType) -> Result<Vec<(Lease, u64)>, PersistenceError> {
        let filter = |row: &Row| row.value.get("lock_type").and_then(|v| v.as_str()) == Some(lock_type.as_str());
        scan_versioned(self.store.as_ref(), &filter).await
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        Ok(self.store.truncate(Table::Locks).await?)
    }
}
