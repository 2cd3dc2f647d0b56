//! Calendars: time exclusions consulted when computing fire times.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A half-open excluded interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    #[serde(default)]
    pub description: Option<String>,
    /// ISO weekday numbers, 1 = Monday .. 7 = Sunday.
    #[serde(default)]
    pub excluded_days_of_week: Vec<u32>,
    #[serde(default)]
    pub excluded_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub excluded_ranges: Vec<ExcludedRange>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_day_of_week(mut self, iso_day: u32) -> Self {
        self.excluded_days_of_week.push(iso_day);
        self
    }

    pub fn exclude_date(mut self, date: NaiveDate) -> Self {
        self.excluded_dates.push(date);
        self
    }

    pub fn exclude_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.excluded_ranges.push(ExcludedRange { start, end });
        self
    }

    pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
        let weekday = time.weekday().number_from_monday();
        if self.excluded_days_of_week.contains(&weekday) {
            return false;
        }
        if self.excluded_dates.contains(&time.date_naive()) {
            return false;
        }
        !self
            .excluded_ranges
            .iter()
            .any(|range| range.start <= time && time < range.end)
    }
}
