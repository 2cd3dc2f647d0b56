//! DAO - テーブルごとのアクセス層
//!
//! 各 DAO は注入された `Arc<dyn Store>` を保持し、型付きの Record を読み書きします。
//! 条件付き書き込みは `cas` モジュールに集約しています。

pub mod calendars;
pub mod cas;
pub mod jobs;
pub mod paused_groups;
pub mod triggers;

pub use self::calendars::CalendarDao;
pub use self::cas::{CasOutcome, update_record};
pub use self::jobs::JobDao;
pub use self::paused_groups::PausedGroups;
pub use self::triggers::{TriggerLedger, acquisition_order};
