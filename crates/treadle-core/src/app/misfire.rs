//! MisfirePolicy - 発火時刻を過ぎたトリガーの補正
//!
//! `now - next_fire_time > threshold` のトリガーを misfire とみなし、
//! トリガーの misfire instruction に従って next_fire_time を動かします。
//! 補正後の時刻はカレンダーの除外を飛ばします。

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::info;

use crate::dao::CalendarDao;
use crate::domain::{MisfireInstruction, PersistenceError, TriggerRecord};
use crate::ports::{Clock, to_delta};

#[derive(Clone)]
pub struct MisfirePolicy {
    clock: Arc<dyn Clock>,
    calendars: CalendarDao,
    threshold: TimeDelta,
}

impl MisfirePolicy {
    pub fn new(clock: Arc<dyn Clock>, calendars: CalendarDao, threshold: Duration) -> Self {
        Self {
            clock,
            calendars,
            threshold: to_delta(threshold),
        }
    }

    pub fn is_misfired(&self, trigger: &TriggerRecord) -> bool {
        trigger
            .next_fire_time
            .is_some_and(|next| self.clock.now() - next > self.threshold)
    }

    /// Corrects a misfired trigger in place; true when `next_fire_time` moved.
    pub async fn apply_misfire(&self, trigger: &mut TriggerRecord) -> Result<bool, PersistenceError> {
        if trigger.misfire_instruction == MisfireInstruction::IgnoreMisfires || !self.is_misfired(trigger) {
            return Ok(false);
        }
        self.correct(trigger).await
    }

    /// Recovery variant: any fire time already in the past is corrected,
    /// without waiting for the threshold.
    pub async fn apply_misfire_on_recovery(&self, trigger: &mut TriggerRecord) -> Result<bool, PersistenceError> {
        let now = self.clock.now();
        if trigger.misfire_instruction == MisfireInstruction::IgnoreMisfires
            || trigger.next_fire_time.is_none_or(|next| next >= now)
        {
            return Ok(false);
        }
        self.correct(trigger).await
    }

    async fn correct(&self, trigger: &mut TriggerRecord) -> Result<bool, PersistenceError> {
        let calendar = self.calendars.for_trigger(trigger.calendar_name.as_deref()).await?;
        let before = trigger.next_fire_time;
        trigger.update_after_misfire(calendar.as_ref(), self.clock.now());
        let changed = trigger.next_fire_time != before;
        if changed {
            info!(
                trigger = %trigger.key,
                instruction = ?trigger.effective_misfire_instruction(),
                missed = ?before,
                next = ?trigger.next_fire_time,
                "misfired trigger rescheduled"
            );
        }
        Ok(changed)
    }
}
