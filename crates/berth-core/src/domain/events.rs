//! Events - 診断イベント
//!
//! バックグラウンドで握りつぶされる失敗（デプロイ失敗、reconcile の補正、
//! cleanup の失敗）を追記専用ログに残すためのイベントです。
//! status フィールドと合わせて「呼び出し元は status を polling する」契約を保ちます。

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::container::ContainerStatus;
use super::ids::{ContainerId, DockerImageId, UploadedImageId};
use super::image::ImageIdentity;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// runtime `run` が失敗し、コンテナが failed になった
    DeployFailed {
        container_id: ContainerId,
        error: String,
    },
    /// reconcile が永続化された status を補正した
    DriftCorrected {
        container_id: ContainerId,
        from: ContainerStatus,
        to: ContainerStatus,
        reason: String,
    },
    /// stop 中に runtime 側のオブジェクトが消えていた
    DriftAbsorbed {
        container_id: ContainerId,
        runtime_id: String,
    },
    /// reconcile 中の 1 コンテナの補正に失敗した
    ReconcileItemFailed {
        container_id: ContainerId,
        error: String,
    },
    /// reconcile pass 全体が失敗した
    ReconcilePassFailed { error: String },
    /// delete 時の runtime remove が失敗した（削除自体は続行）
    CleanupFailed {
        container_id: ContainerId,
        runtime_id: String,
        error: String,
    },
    ImageActivated {
        image_id: DockerImageId,
        identity: ImageIdentity,
        runtime_image_id: String,
    },
    ImageDeactivated {
        image_id: DockerImageId,
        identity: ImageIdentity,
    },
    ImageLoadFailed {
        uploaded_image_id: Option<UploadedImageId>,
        identity: ImageIdentity,
        error: String,
    },
}

/// ログに追記された 1 件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}
