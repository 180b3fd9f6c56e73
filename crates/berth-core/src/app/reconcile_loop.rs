//! ReconcileLoop - 定期的に永続状態を runtime の実態に合わせる
//!
//! # 設計原則
//! - 失敗した pass でループを抜けない（ログと診断イベントを残して次の interval へ）
//! - shutdown は補正と補正の間でのみ観測する（補正の途中で止めない）
//!
//! # 実装詳細
//! - `watch::channel(false)` で shutdown を伝える
//! - interval 待ちは `tokio::select!` で shutdown と競合させる

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::container_manager::ContainerManager;
use crate::domain::DomainEvent;
use crate::ports::EventSink;

pub struct ReconcileLoop;

impl ReconcileLoop {
    /// Spawn the loop on the current tokio runtime. The first pass runs immediately.
    /// Dropping the returned handle stops the loop at its next interval wait.
    #[must_use = "dropping the handle stops the reconcile loop"]
    pub fn spawn(
        manager: Arc<ContainerManager>,
        events: Arc<dyn EventSink>,
        interval: Duration,
    ) -> ReconcileHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            reconcile_loop(manager, events, interval, shutdown_rx).await;
        });
        ReconcileHandle { shutdown_tx, join }
    }
}

/// Handle to a running reconcile loop.
/// - `request_shutdown()` で次の補正の前に止まる
/// - `shutdown_and_join()` で終了まで待てる
/// - drop すると次の interval 待ちで止まる
#[must_use = "dropping the handle stops the reconcile loop"]
pub struct ReconcileHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReconcileHandle {
    pub fn request_shutdown(&self) {
        // receiver は既に drop されている可能性がある
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            warn!(error = %e, "reconcile loop task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

async fn reconcile_loop(
    manager: Arc<ContainerManager>,
    events: Arc<dyn EventSink>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(?interval, "reconcile loop started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let stop_requested = || *shutdown_rx.borrow();
        match manager.reconcile_running_until(stop_requested).await {
            Ok(report) if report.corrected() > 0 || report.errors > 0 => {
                info!(
                    checked = report.checked,
                    failed = report.failed,
                    stopped = report.stopped,
                    refreshed = report.refreshed,
                    errors = report.errors,
                    "reconcile pass corrected drift"
                );
            }
            Ok(report) => debug!(checked = report.checked, "reconcile pass clean"),
            Err(e) => {
                warn!(error = %e, "reconcile pass failed");
                events.emit(DomainEvent::ReconcilePassFailed {
                    error: e.to_string(),
                });
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender 側 (handle) が drop された場合も停止扱い
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("reconcile loop stopped");
}
