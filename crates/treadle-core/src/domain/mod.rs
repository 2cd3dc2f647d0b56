//! Domain model: keys, leases, liveness, jobs, triggers, schedules, calendars.
//!
//! ストアの行として保存されるレコード型と、その純粋なロジック（発火時刻の計算、
//! ミスファイア補正、失効判定）をまとめています。I/O はここにはありません。

pub mod calendar;
pub mod errors;
pub mod ids;
pub mod job;
pub mod keys;
pub mod lease;
pub mod liveness;
pub mod schedule;
pub mod state;
pub mod trigger;

pub use self::calendar::{Calendar, ExcludedRange};
pub use self::errors::{ErrorKind, PersistenceError, Result, StoreError};
pub use self::ids::{FireInstanceId, JobId};
pub use self::job::{JobData, JobDetail, JobRecord, merge_job_data};
pub use self::keys::{DEFAULT_GROUP, GroupMatcher, JobKey, RECOVERY_GROUP, TriggerKey};
pub use self::lease::{Lease, LockType};
pub use self::liveness::LivenessRecord;
pub use self::schedule::{IntervalUnit, REPEAT_INDEFINITELY, Schedule};
pub use self::state::{CompletedExecutionInstruction, TriggerState};
pub use self::trigger::{DEFAULT_PRIORITY, MisfireInstruction, TriggerRecord};
