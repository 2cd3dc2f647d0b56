//! Schedule kinds and fire-time math.
//!
//! 4 種類のスケジュールを tagged enum で表現します。行には `kind` 判別子と
//! 各バリアント固有のフィールドがそのまま保存されます。
//!
//! All times are UTC. Cron expressions use the six/seven-field form (seconds first).

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::errors::PersistenceError;
use super::trigger::MisfireInstruction;

/// `repeat_count` value meaning "repeat forever".
pub const REPEAT_INDEFINITELY: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    fn fixed_millis(self) -> Option<i64> {
        match self {
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            IntervalUnit::Day => Some(86_400_000),
            IntervalUnit::Week => Some(7 * 86_400_000),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }

    fn months(self) -> Option<u32> {
        match self {
            IntervalUnit::Month => Some(1),
            IntervalUnit::Year => Some(12),
            _ => None,
        }
    }

    fn is_time_of_day_unit(self) -> bool {
        matches!(self, IntervalUnit::Second | IntervalUnit::Minute | IntervalUnit::Hour)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Simple {
        repeat_interval_ms: i64,
        repeat_count: i32,
        #[serde(default)]
        times_triggered: u32,
    },
    Cron {
        expression: String,
    },
    CalendarInterval {
        interval: u32,
        unit: IntervalUnit,
        #[serde(default)]
        times_triggered: u32,
    },
    DailyTimeInterval {
        interval: u32,
        unit: IntervalUnit,
        start_time_of_day: NaiveTime,
        end_time_of_day: NaiveTime,
        /// ISO weekday numbers; empty means every day.
        #[serde(default)]
        days_of_week: Vec<u32>,
        repeat_count: i32,
        #[serde(default)]
        times_triggered: u32,
    },
}

impl Schedule {
    /// Fires exactly once at the trigger's start time.
    pub fn one_shot() -> Self {
        Schedule::Simple {
            repeat_interval_ms: 0,
            repeat_count: 0,
            times_triggered: 0,
        }
    }

    pub fn simple(interval: Duration, repeat_count: i32) -> Self {
        Schedule::Simple {
            repeat_interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
            repeat_count,
            times_triggered: 0,
        }
    }

    pub fn repeat_forever(interval: Duration) -> Self {
        Self::simple(interval, REPEAT_INDEFINITELY)
    }

    pub fn cron(expression: impl Into<String>) -> Result<Self, PersistenceError> {
        let schedule = Schedule::Cron {
            expression: expression.into(),
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn calendar_interval(interval: u32, unit: IntervalUnit) -> Self {
        Schedule::CalendarInterval {
            interval,
            unit,
            times_triggered: 0,
        }
    }

    pub fn daily_time_interval(
        interval: u32,
        unit: IntervalUnit,
        start_time_of_day: NaiveTime,
        end_time_of_day: NaiveTime,
        days_of_week: Vec<u32>,
    ) -> Self {
        Schedule::DailyTimeInterval {
            interval,
            unit,
            start_time_of_day,
            end_time_of_day,
            days_of_week,
            repeat_count: REPEAT_INDEFINITELY,
            times_triggered: 0,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Schedule::Simple { .. } => "simple",
            Schedule::Cron { .. } => "cron",
            Schedule::CalendarInterval { .. } => "calendar_interval",
            Schedule::DailyTimeInterval { .. } => "daily_time_interval",
        }
    }

    /// Rejects field combinations that can never produce a sensible fire time.
    pub fn validate(&self) -> Result<(), PersistenceError> {
        match self {
            Schedule::Simple {
                repeat_interval_ms,
                repeat_count,
                ..
            } => {
                if *repeat_count < REPEAT_INDEFINITELY {
                    return Err(invalid(format!("repeat count {repeat_count} is negative")));
                }
                if *repeat_count != 0 && *repeat_interval_ms <= 0 {
                    return Err(invalid("repeating simple schedule needs a positive interval"));
                }
            }
            Schedule::Cron { expression } => {
                cron::Schedule::from_str(expression)
                    .map_err(|e| invalid(format!("cron expression '{expression}': {e}")))?;
            }
            Schedule::CalendarInterval { interval, .. } => {
                if *interval == 0 {
                    return Err(invalid("calendar interval must be positive"));
                }
            }
            Schedule::DailyTimeInterval {
                interval,
                unit,
                start_time_of_day,
                end_time_of_day,
                days_of_week,
                repeat_count,
                ..
            } => {
                if *interval == 0 || !unit.is_time_of_day_unit() {
                    return Err(invalid("daily interval needs a positive second/minute/hour step"));
                }
                if start_time_of_day > end_time_of_day {
                    return Err(invalid("daily window starts after it ends"));
                }
                if days_of_week.iter().any(|day| !(1..=7).contains(day)) {
                    return Err(invalid("days of week must be ISO numbers 1..=7"));
                }
                if *repeat_count < REPEAT_INDEFINITELY {
                    return Err(invalid(format!("repeat count {repeat_count} is negative")));
                }
            }
        }
        Ok(())
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Schedule::Simple { repeat_count: 0, .. })
    }

    /// Instruction that `MisfireInstruction::Smart` resolves to for this kind.
    pub fn smart_misfire_instruction(&self) -> MisfireInstruction {
        match self {
            Schedule::Simple { repeat_count: 0, .. } => MisfireInstruction::FireNow,
            Schedule::Simple {
                repeat_count: REPEAT_INDEFINITELY,
                ..
            } => MisfireInstruction::SkipToNext,
            Schedule::Simple { .. } => MisfireInstruction::RescheduleFromNow,
            _ => MisfireInstruction::FireNow,
        }
    }

    /// First fire time strictly after `after`, bounded by `start` and `end`.
    pub fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let candidate = match self {
            Schedule::Simple {
                repeat_interval_ms,
                repeat_count,
                times_triggered,
            } => simple_fire_time_after(*repeat_interval_ms, *repeat_count, *times_triggered, start, after),
            Schedule::Cron { expression } => cron_fire_time_after(expression, start, after),
            Schedule::CalendarInterval { interval, unit, .. } => {
                calendar_interval_fire_time_after(*interval, *unit, start, after)
            }
            Schedule::DailyTimeInterval {
                interval,
                unit,
                start_time_of_day,
                end_time_of_day,
                days_of_week,
                repeat_count,
                times_triggered,
            } => {
                if repeat_limit_reached(*repeat_count, *times_triggered) {
                    None
                } else {
                    daily_fire_time_after(
                        *interval,
                        *unit,
                        *start_time_of_day,
                        *end_time_of_day,
                        days_of_week,
                        start,
                        after,
                    )
                }
            }
        }?;
        match end {
            Some(end) if candidate > end => None,
            _ => Some(candidate),
        }
    }

    /// Counts one more fire.
    pub fn record_fired(&mut self) {
        match self {
            Schedule::Simple { times_triggered, .. }
            | Schedule::CalendarInterval { times_triggered, .. }
            | Schedule::DailyTimeInterval { times_triggered, .. } => {
                *times_triggered = times_triggered.saturating_add(1);
            }
            Schedule::Cron { .. } => {}
        }
    }

    /// Keeps only the remaining repeats and restarts the count, used when a
    /// simple schedule is rebased on a new start time.
    pub fn restart_remaining_repeats(&mut self) {
        if let Schedule::Simple {
            repeat_count,
            times_triggered,
            ..
        } = self
            && *repeat_count > 0
        {
            let done = i32::try_from(*times_triggered).unwrap_or(i32::MAX);
            *repeat_count = (*repeat_count - done).max(0);
            *times_triggered = 0;
        }
    }
}

fn invalid(reason: impl Into<String>) -> PersistenceError {
    PersistenceError::InvalidSchedule(reason.into())
}

fn repeat_limit_reached(repeat_count: i32, times_triggered: u32) -> bool {
    repeat_count != REPEAT_INDEFINITELY && i64::from(times_triggered) > i64::from(repeat_count)
}

fn simple_fire_time_after(
    interval_ms: i64,
    repeat_count: i32,
    times_triggered: u32,
    start: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if repeat_limit_reached(repeat_count, times_triggered) {
        return None;
    }
    if after < start {
        return Some(start);
    }
    if repeat_count == 0 || interval_ms <= 0 {
        return None;
    }
    let fires = (after - start).num_milliseconds() / interval_ms + 1;
    if repeat_count != REPEAT_INDEFINITELY && fires > i64::from(repeat_count) {
        return None;
    }
    start.checked_add_signed(TimeDelta::milliseconds(fires.checked_mul(interval_ms)?))
}

fn cron_fire_time_after(expression: &str, start: DateTime<Utc>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(expression).ok()?;
    let lower = if after < start {
        start - TimeDelta::seconds(1)
    } else {
        after
    };
    schedule.after(&lower).find(|time| *time >= start && *time > after)
}

fn calendar_interval_fire_time_after(
    interval: u32,
    unit: IntervalUnit,
    start: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if interval == 0 {
        return None;
    }
    if after < start {
        return Some(start);
    }
    if let Some(unit_ms) = unit.fixed_millis() {
        let step = unit_ms.checked_mul(i64::from(interval))?;
        let steps = (after - start).num_milliseconds() / step + 1;
        return start.checked_add_signed(TimeDelta::milliseconds(steps.checked_mul(step)?));
    }

    let months_per_step = unit.months()?.checked_mul(interval)?;
    let elapsed_months =
        (after.year() - start.year()) * 12 + after.month() as i32 - start.month() as i32;
    let mut steps = (elapsed_months.max(0) as u32 / months_per_step).saturating_sub(1);
    loop {
        let candidate = start.checked_add_months(Months::new(steps.checked_mul(months_per_step)?))?;
        if candidate > after {
            return Some(candidate);
        }
        steps += 1;
    }
}

fn daily_fire_time_after(
    interval: u32,
    unit: IntervalUnit,
    start_time_of_day: NaiveTime,
    end_time_of_day: NaiveTime,
    days_of_week: &[u32],
    start: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !unit.is_time_of_day_unit() {
        return None;
    }
    let step = unit.fixed_millis()?.checked_mul(i64::from(interval))?;
    if step <= 0 {
        return None;
    }
    // the result must be strictly after `lower`
    let lower = if after < start {
        start - TimeDelta::milliseconds(1)
    } else {
        after
    };

    let mut day = lower.date_naive();
    for _ in 0..8 {
        let included =
            days_of_week.is_empty() || days_of_week.contains(&day.weekday().number_from_monday());
        if included {
            let window_start = day.and_time(start_time_of_day).and_utc();
            let window_end = day.and_time(end_time_of_day).and_utc();
            let steps = if lower < window_start {
                0
            } else {
                (lower - window_start).num_milliseconds() / step + 1
            };
            let candidate = window_start.checked_add_signed(TimeDelta::milliseconds(steps.checked_mul(step)?))?;
            if candidate <= window_end {
                return Some(candidate);
            }
        }
        day = day.succ_opt()?;
    }
    None
}
