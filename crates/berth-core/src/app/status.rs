//! Status - ステータスクエリ

use serde::{Deserialize, Serialize};

use crate::domain::{Container, ContainerStatus};

/// status ごとのコンテナ数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCounts {
    pub pending: usize,
    pub running: usize,
    pub stopped: usize,
    pub failed: usize,
}

impl ContainerCounts {
    pub fn tally<'a>(containers: impl IntoIterator<Item = &'a Container>) -> Self {
        let mut counts = Self::default();
        for c in containers {
            match c.status {
                ContainerStatus::Pending => counts.pending += 1,
                ContainerStatus::Running => counts.running += 1,
                ContainerStatus::Stopped => counts.stopped += 1,
                ContainerStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.stopped + self.failed
    }
}

/// 1 回の reconcile pass の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// running として調べたコンテナ数
    pub checked: usize,
    /// failed に補正した数
    pub failed: usize,
    /// stopped に補正した数
    pub stopped: usize,
    /// exposed port を書き換えた数
    pub refreshed: usize,
    /// 補正に失敗した数
    pub errors: usize,
}

impl ReconcileReport {
    pub fn corrected(&self) -> usize {
        self.failed + self.stopped + self.refreshed
    }
}
