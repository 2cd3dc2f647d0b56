//! Paused job / trigger groups: one row per paused group.

use std::sync::Arc;

use serde_json::json;

use super::cas::str_field;
use crate::domain::PersistenceError;
use crate::ports::{Store, Table, all_rows};

#[derive(Clone)]
pub struct PausedGroups {
    store: Arc<dyn Store>,
    table: Table,
}

impl PausedGroups {
    pub fn triggers(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            table: Table::PausedTriggerGroups,
        }
    }

    pub fn jobs(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            table: Table::PausedJobGroups,
        }
    }

    pub async fn pause(&self, group: &str) -> Result<(), PersistenceError> {
        self.store.put(self.table, group, json!({ "group": group })).await?;
        Ok(())
    }

    pub async fn pause_all(&self, groups: &[String]) -> Result<(), PersistenceError> {
        for group in groups {
            self.pause(group).await?;
        }
        Ok(())
    }

    pub async fn resume(&self, group: &str) -> Result<bool, PersistenceError> {
        Ok(self.store.delete(self.table, group).await?)
    }

    pub async fn is_paused(&self, group: &str) -> Result<bool, PersistenceError> {
        Ok(self.store.get(self.table, group).await?.is_some())
    }

    pub async fn all(&self) -> Result<Vec<String>, PersistenceError> {
        let rows = self.store.scan(self.table, &all_rows).await?;
        Ok(rows
            .iter()
            .filter_map(|row| str_field(row, "group").map(str::to_string))
            .collect())
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        Ok(self.store.truncate(self.table).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;

    #[tokio::test]
    async fn job_and_trigger_groups_are_separate() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let triggers = PausedGroups::triggers(store.clone());
        let jobs = PausedGroups::jobs(store);

        triggers.pause("reports").await.unwrap();
        assert!(triggers.is_paused("reports").await.unwrap());
        assert!(!jobs.is_paused("reports").await.unwrap());

        assert!(triggers.resume("reports").await.unwrap());
        assert!(!triggers.resume("reports").await.unwrap());
        assert!(triggers.all().await.unwrap().is_empty());
    }
}
