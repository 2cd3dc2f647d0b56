//! CheckinLoop / RecoveryLoop / ClusterTasks
//!
//! 各ノードはクラスタモードで 2 つのバックグラウンドタスクを持ちます。
//! - CheckinLoop: 一定間隔で liveness 行を書き込む。失敗時は CheckinErrorHandler へ
//! - RecoveryLoop: 一定間隔で Recoverer を実行する
//!
//! `ClusterTasks` は watch チャネルでまとめて停止させます。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use super::liveness::LivenessRegistry;
use super::recoverer::{RecoveryReport, Recoverer};
use crate::domain::PersistenceError;

/// Called when a check-in write fails.
pub trait CheckinErrorHandler: Send + Sync {
    fn on_checkin_failure(&self, error: &PersistenceError);
}

/// Default handler: a node that cannot prove it is alive stops, so peers can
/// safely take over its leases.
#[derive(Debug, Clone, Copy, Default)]
pub struct FatalCheckinHandler;

impl CheckinErrorHandler for FatalCheckinHandler {
    fn on_checkin_failure(&self, error: &PersistenceError) {
        error!(error = %error, "check-in failed, terminating the process");
        std::process::exit(1);
    }
}

/// Handler that only logs and counts failures.
#[derive(Debug, Default)]
pub struct LoggingCheckinHandler {
    failures: AtomicUsize,
}

impl LoggingCheckinHandler {
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl CheckinErrorHandler for LoggingCheckinHandler {
    fn on_checkin_failure(&self, error: &PersistenceError) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        error!(error = %error, failures, "check-in failed");
    }
}

pub struct CheckinLoop {
    liveness: LivenessRegistry,
    handler: Arc<dyn CheckinErrorHandler>,
    interval: Duration,
}

impl CheckinLoop {
    pub fn new(liveness: LivenessRegistry, handler: Arc<dyn CheckinErrorHandler>, interval: Duration) -> Self {
        Self {
            liveness,
            handler,
            interval,
        }
    }

    /// One check-in; false when the write failed.
    pub async fn tick(&self) -> bool {
        match self.liveness.check_in().await {
            Ok(_) => true,
            Err(err) => {
                self.handler.on_checkin_failure(&err);
                false
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!(instance = %self.liveness.instance_id(), "check-in loop stopped");
    }
}

pub struct RecoveryLoop {
    recoverer: Recoverer,
    interval: Duration,
}

impl RecoveryLoop {
    pub fn new(recoverer: Recoverer, interval: Duration) -> Self {
        Self { recoverer, interval }
    }

    pub async fn tick(&self) -> Option<RecoveryReport> {
        match self.recoverer.recover().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "recovery pass failed");
                None
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("recovery loop stopped");
    }
}

/// Background tasks of a clustered node.
/// - `request_shutdown()` で両方のループに停止を伝える
/// - `shutdown_and_join()` で終了を待つ
pub struct ClusterTasks {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ClusterTasks {
    pub fn spawn(checkin: CheckinLoop, recovery: RecoveryLoop) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = vec![
            tokio::spawn(checkin.run(shutdown_rx.clone())),
            tokio::spawn(recovery.run(shutdown_rx)),
        ];
        info!("cluster tasks started");
        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "cluster task ended abnormally");
            }
        }
        info!("cluster tasks stopped");
    }
}
