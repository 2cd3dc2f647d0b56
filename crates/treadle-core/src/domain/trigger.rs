//! Trigger records.
//!
//! TriggerRecord は状態フィールドと next_fire_time を持つ共有可変データです。
//! 変更はリースを保持したノードだけが行います（acquire / fire / complete / recover）。

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::Calendar;
use super::ids::{FireInstanceId, JobId};
use super::job::JobData;
use super::keys::{JobKey, TriggerKey};
use super::schedule::Schedule;
use super::state::TriggerState;

/// Priority given to triggers that do not set one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Exclusion skipping stops after this many candidates or this many years ahead.
const MAX_CALENDAR_SKIPS: usize = 100_000;
const MAX_YEARS_AHEAD: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Resolved per schedule kind, see `Schedule::smart_misfire_instruction`.
    Smart,
    /// Never treated as misfired; late fire times are fired as they are.
    IgnoreMisfires,
    FireNow,
    SkipToNext,
    RescheduleFromNow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub key: TriggerKey,
    pub job_key: JobKey,
    /// Stamped by the persister when the trigger is stored.
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub calendar_name: Option<String>,
    #[serde(default)]
    pub job_data: JobData,
    pub priority: i32,
    pub state: TriggerState,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub misfire_instruction: MisfireInstruction,
    #[serde(default)]
    pub fire_instance_id: Option<FireInstanceId>,
    /// Set once a fire is handed to the host, cleared on completion.
    #[serde(default)]
    pub executing: bool,
    pub schedule: Schedule,
}

impl TriggerRecord {
    /// A trigger whose first fire time is `start_time`.
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule, start_time: DateTime<Utc>) -> Self {
        let next_fire_time = schedule.fire_time_after(start_time, None, start_time - chrono::TimeDelta::milliseconds(1));
        Self {
            key,
            job_key,
            job_id: None,
            description: None,
            calendar_name: None,
            job_data: JobData::new(),
            priority: DEFAULT_PRIORITY,
            state: TriggerState::Waiting,
            start_time,
            end_time: None,
            next_fire_time,
            previous_fire_time: None,
            misfire_instruction: MisfireInstruction::Smart,
            fire_instance_id: None,
            executing: false,
            schedule,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    pub fn with_job_data(mut self, job_data: JobData) -> Self {
        self.job_data = job_data;
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    pub fn with_next_fire_time(mut self, next_fire_time: Option<DateTime<Utc>>) -> Self {
        self.next_fire_time = next_fire_time;
        self
    }

    pub fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.fire_time_after(self.start_time, self.end_time, after)
    }

    /// First fire time after `after` that the calendar does not exclude.
    pub fn included_fire_time_after(&self, after: DateTime<Utc>, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        let mut candidate = self.fire_time_after(after)?;
        let Some(calendar) = calendar else {
            return Some(candidate);
        };
        let give_up_year = candidate.year() + MAX_YEARS_AHEAD;
        for _ in 0..MAX_CALENDAR_SKIPS {
            if calendar.is_time_included(candidate) {
                return Some(candidate);
            }
            candidate = self.fire_time_after(candidate)?;
            if candidate.year() > give_up_year {
                return None;
            }
        }
        None
    }

    /// Recomputes the first fire time from `start_time`, honoring the calendar.
    pub fn compute_first_fire_time(&mut self, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        let before_start = self.start_time - chrono::TimeDelta::milliseconds(1);
        self.next_fire_time = self.included_fire_time_after(before_start, calendar);
        self.next_fire_time
    }

    /// Advances the schedule past the fire time that was just used.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        self.schedule.record_fired();
        self.previous_fire_time = self.next_fire_time;
        self.next_fire_time = self
            .next_fire_time
            .and_then(|fired| self.included_fire_time_after(fired, calendar));
    }

    /// Instruction actually applied on misfire.
    pub fn effective_misfire_instruction(&self) -> MisfireInstruction {
        match self.misfire_instruction {
            MisfireInstruction::Smart => self.schedule.smart_misfire_instruction(),
            other => other,
        }
    }

    /// Moves `next_fire_time` according to the misfire instruction.
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        match self.effective_misfire_instruction() {
            MisfireInstruction::Smart | MisfireInstruction::IgnoreMisfires => {}
            MisfireInstruction::FireNow => {
                self.next_fire_time = Some(now);
            }
            MisfireInstruction::SkipToNext => {
                self.next_fire_time = self.included_fire_time_after(now, calendar);
            }
            MisfireInstruction::RescheduleFromNow => {
                self.schedule.restart_remaining_repeats();
                self.start_time = now;
                self.compute_first_fire_time(calendar);
            }
        }
        if let (Some(next), Some(end)) = (self.next_fire_time, self.end_time)
            && next > end
        {
            self.next_fire_time = None;
        }
    }

    /// Whether the trigger has another fire time to wait for.
    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta, TimeZone};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn every_minute() -> TriggerRecord {
        TriggerRecord::new(
            TriggerKey::new("t1", "g1"),
            JobKey::new("j1", "g1"),
            Schedule::repeat_forever(Duration::from_secs(60)),
            t0(),
        )
    }

    #[test]
    fn new_trigger_starts_waiting_at_start_time() {
        let trigger = every_minute();
        assert_eq!(trigger.state, TriggerState::Waiting);
        assert_eq!(trigger.next_fire_time, Some(t0()));
        assert_eq!(trigger.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn triggered_advances_previous_and_next() {
        let mut trigger = every_minute();
        trigger.triggered(None);
        assert_eq!(trigger.previous_fire_time, Some(t0()));
        assert_eq!(trigger.next_fire_time, Some(t0() + TimeDelta::minutes(1)));
    }

    #[test]
    fn triggered_skips_calendar_exclusions() {
        let mut trigger = TriggerRecord::new(
            TriggerKey::new("daily", "g1"),
            JobKey::new("j1", "g1"),
            Schedule::repeat_forever(Duration::from_secs(86_400)),
            t0(),
        );
        let calendar = Calendar::new().exclude_date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        trigger.triggered(Some(&calendar));
        assert_eq!(trigger.next_fire_time, Some(t0() + TimeDelta::days(2)));
    }

    #[test]
    fn one_shot_is_exhausted_after_firing() {
        let mut trigger = TriggerRecord::new(
            TriggerKey::new("once", "g1"),
            JobKey::new("j1", "g1"),
            Schedule::one_shot(),
            t0(),
        );
        trigger.triggered(None);
        assert!(!trigger.may_fire_again());
    }

    #[test]
    fn skip_to_next_lands_after_now() {
        let mut trigger = every_minute().with_misfire_instruction(MisfireInstruction::SkipToNext);
        let now = t0() + TimeDelta::seconds(150);
        trigger.update_after_misfire(None, now);
        assert_eq!(trigger.next_fire_time, Some(t0() + TimeDelta::minutes(3)));
    }

    #[test]
    fn reschedule_from_now_rebases_start() {
        let mut trigger = TriggerRecord::new(
            TriggerKey::new("t", "g"),
            JobKey::new("j", "g"),
            Schedule::simple(Duration::from_secs(60), 3),
            t0(),
        )
        .with_misfire_instruction(MisfireInstruction::RescheduleFromNow);
        let now = t0() + TimeDelta::seconds(90);
        trigger.update_after_misfire(None, now);
        assert_eq!(trigger.start_time, now);
        assert_eq!(trigger.next_fire_time, Some(now));
    }

    #[test]
    fn misfire_past_end_time_exhausts() {
        let mut trigger = every_minute()
            .with_end_time(t0() + TimeDelta::minutes(2))
            .with_misfire_instruction(MisfireInstruction::SkipToNext);
        trigger.update_after_misfire(None, t0() + TimeDelta::minutes(5));
        assert_eq!(trigger.next_fire_time, None);
    }
}
