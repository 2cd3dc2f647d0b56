//! Trigger state machine.

use serde::{Deserialize, Serialize};

/// Trigger state.
///
/// State transitions:
/// - Waiting -> Acquired -> Waiting (fired, more fire times left)
/// - Waiting -> Acquired -> Complete (fired, schedule exhausted)
/// - Waiting -> Acquired -> Blocked -> Waiting (job disallows concurrent execution)
/// - Waiting <-> Paused
/// - any -> Error (completion instruction) -> Waiting (reset_trigger_from_error_state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Eligible for acquisition once its next fire time is due.
    Waiting,

    /// Excluded from acquisition until resumed.
    Paused,

    /// Leased by a node and about to fire.
    Acquired,

    /// Its job is running and disallows concurrent execution.
    Blocked,

    /// No more fire times, or completed by instruction.
    Complete,

    /// Marked failed by a completion instruction.
    Error,
}

impl TriggerState {
    /// Stored representation, used by raw-row scan filters.
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Paused => "PAUSED",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Error => "ERROR",
        }
    }

    /// Can the acquirer pick this trigger up?
    pub fn is_acquirable(self) -> bool {
        matches!(self, TriggerState::Waiting)
    }

    /// Still expected to fire again?
    pub fn is_live(self) -> bool {
        !matches!(self, TriggerState::Complete | TriggerState::Error)
    }
}

/// What the host scheduler asks the store to do after a job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersComplete,
    SetAllJobTriggersError,
}
