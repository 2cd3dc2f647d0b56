//! Jobs table access.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::cas::{get_record, insert_record, key_group, put_record, scan_records};
use crate::domain::{GroupMatcher, JobKey, JobRecord, PersistenceError};
use crate::ports::{Row, Store, Table, all_rows};

#[derive(Clone)]
pub struct JobDao {
    store: Arc<dyn Store>,
}

impl JobDao {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &JobKey) -> Result<Option<JobRecord>, PersistenceError> {
        get_record(self.store.as_ref(), &key.storage_key()).await
    }

    pub async fn exists(&self, key: &JobKey) -> Result<bool, PersistenceError> {
        Ok(self.store.get(Table::Jobs, &key.storage_key()).await?.is_some())
    }

    /// Insert-if-absent.
    pub async fn insert(&self, job: &JobRecord) -> Result<bool, PersistenceError> {
        insert_record(self.store.as_ref(), job).await
    }

    pub async fn put(&self, job: &JobRecord) -> Result<(), PersistenceError> {
        put_record(self.store.as_ref(), job).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &JobKey) -> Result<bool, PersistenceError> {
        Ok(self.store.delete(Table::Jobs, &key.storage_key()).await?)
    }

    pub async fn requests_recovery(&self, key: &JobKey) -> Result<bool, PersistenceError> {
        Ok(self
            .get(key)
            .await?
            .is_some_and(|job| job.detail.requests_recovery))
    }

    pub async fn all(&self) -> Result<Vec<JobRecord>, PersistenceError> {
        scan_records(self.store.as_ref(), &all_rows).await
    }

    pub async fn keys_matching(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>, PersistenceError> {
        let filter = |row: &Row| key_group(row).is_some_and(|group| matcher.matches(group));
        let jobs: Vec<JobRecord> = scan_records(self.store.as_ref(), &filter).await?;
        Ok(jobs.into_iter().map(|job| job.detail.key).collect())
    }

    pub async fn group_names(&self) -> Result<Vec<String>, PersistenceError> {
        let rows = self.store.scan(Table::Jobs, &all_rows).await?;
        let groups: BTreeSet<String> = rows.iter().filter_map(key_group).map(str::to_string).collect();
        Ok(groups.into_iter().collect())
    }

    pub async fn count(&self) -> Result<usize, PersistenceError> {
        Ok(self.store.scan(Table::Jobs, &all_rows).await?.len())
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        Ok(self.store.truncate(Table::Jobs).await?)
    }
}
