//! Cluster - ノード間の調停
//!
//! ノード同士はメモリを共有せず、すべての調停はストア上の行で行います。
//! - **LivenessRegistry**: 各ノードの check-in 行
//! - **ExpiryPolicy**: リースが回収可能かの判定
//! - **LeaseLock**: job / trigger 単位の分散ロック
//! - **Recoverer**: 停止したノードのリースとトリガーの回収
//! - **CheckinLoop / RecoveryLoop / ClusterTasks**: バックグラウンドタスク

pub mod checkin;
pub mod expiry;
pub mod lease_lock;
pub mod liveness;
pub mod recoverer;

pub use self::checkin::{
    CheckinErrorHandler, CheckinLoop, ClusterTasks, FatalCheckinHandler, LoggingCheckinHandler, RecoveryLoop,
};
pub use self::expiry::ExpiryPolicy;
pub use self::lease_lock::{LeaseLock, LeaseOutcome};
pub use self::liveness::LivenessRegistry;
pub use self::recoverer::{RecoveryReport, RecoveryTriggerFactory, Recoverer};
