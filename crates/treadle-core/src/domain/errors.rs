//! Errors - エラー型と分類
//!
//! ストア層は `StoreError`、その上の全コンポーネントは `PersistenceError` を返します。
//! `PersistenceError::kind()` で運用上の分類（接続・競合・データ・設定）を取り出せます。

use std::fmt;

/// Failure reported by a `Store` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store call timed out: {0}")]
    Timeout(String),

    #[error("store rejected the request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Connectivity failures are the only ones worth a reconnect.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// ErrorKind は永続化エラーの分類
///
/// - Connectivity: ストアに到達できない（1 回だけ再接続してから表面化）
/// - Conflict: 既に存在する / ロック取得済み（自動リトライしない）
/// - Data: 壊れた行・未知の型（その行だけ中断）
/// - Configuration: ジョブ不在・ジョブ不一致・不正な設定（即座に拒否）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Conflict,
    Data,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Data => "data",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(label)
    }
}

/// The single persistence failure type surfaced to the host scheduler.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{entity} '{key}' already exists")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("replacement trigger targets job '{replacement}' but '{original}' was expected")]
    JobMismatch { original: String, replacement: String },

    #[error("calendar '{0}' is still referenced by triggers")]
    CalendarInUse(String),

    #[error("calendar '{0}' not found")]
    CalendarNotFound(String),

    #[error("malformed row '{key}' in {table}: {reason}")]
    Corrupt {
        table: &'static str,
        key: String,
        reason: String,
    },

    #[error("unknown job type '{0}'")]
    UnknownJobType(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistenceError::Store(_) => ErrorKind::Connectivity,
            PersistenceError::AlreadyExists { .. } => ErrorKind::Conflict,
            PersistenceError::Corrupt { .. }
            | PersistenceError::UnknownJobType(_)
            | PersistenceError::InvalidSchedule(_) => ErrorKind::Data,
            PersistenceError::JobNotFound(_)
            | PersistenceError::JobMismatch { .. }
            | PersistenceError::CalendarInUse(_)
            | PersistenceError::CalendarNotFound(_)
            | PersistenceError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }
}

pub type Result<T, E = PersistenceError> = std::result::Result<T, E>;
