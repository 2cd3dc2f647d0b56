//! Calendars table access.

use std::sync::Arc;

use super::cas::{get_record, insert_record, put_record, scan_records};
use crate::domain::{Calendar, PersistenceError};
use crate::ports::{Store, Table, all_rows};
use crate::typed::CalendarRecord;

#[derive(Clone)]
pub struct CalendarDao {
    store: Arc<dyn Store>,
}

impl CalendarDao {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Calendar>, PersistenceError> {
        let record: Option<CalendarRecord> = get_record(self.store.as_ref(), name).await?;
        Ok(record.map(|record| record.calendar))
    }

    /// Calendar named by a trigger, if it names one.
    pub async fn for_trigger(&self, calendar_name: Option<&str>) -> Result<Option<Calendar>, PersistenceError> {
        match calendar_name {
            Some(name) => self.get(name).await,
            None => Ok(None),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, PersistenceError> {
        Ok(self.store.get(Table::Calendars, name).await?.is_some())
    }

    pub async fn insert(&self, name: &str, calendar: &Calendar) -> Result<bool, PersistenceError> {
        insert_record(self.store.as_ref(), &record(name, calendar)).await
    }

    pub async fn put(&self, name: &str, calendar: &Calendar) -> Result<(), PersistenceError> {
        put_record(self.store.as_ref(), &record(name, calendar)).await?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<bool, PersistenceError> {
        Ok(self.store.delete(Table::Calendars, name).await?)
    }

    pub async fn names(&self) -> Result<Vec<String>, PersistenceError> {
        let records: Vec<CalendarRecord> = scan_records(self.store.as_ref(), &all_rows).await?;
        Ok(records.into_iter().map(|record| record.name).collect())
    }

    pub async fn count(&self) -> Result<usize, PersistenceError> {
        Ok(self.store.scan(Table::Calendars, &all_rows).await?.len())
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        Ok(self.store.truncate(Table::Calendars).await?)
    }
}

fn record(name: &str, calendar: &Calendar) -> CalendarRecord {
    CalendarRecord {
        name: name.to_string(),
        calendar: calendar.clone(),
    }
}
