//! Errors - エラー型と分類
//!
//! # 伝播ポリシー
//! - リクエスト検証の失敗（参照先なし、状態の衝突）は呼び出し元に同期的に返す
//! - デプロイや reconcile の失敗はエンティティの status に記録し、ログに残す（raise しない）
//! - drift（runtime と永続層の不一致）はエラーにしない

use crate::domain::ids::{ContainerId, DockerImageId, UploadedImageId};
use crate::ports::{RepositoryError, RuntimeError};

/// ErrorKind は呼び出し元向けの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 参照先のエンティティが永続層に存在しない
    NotFound,
    /// 現在の状態では実行できない操作
    Conflict,
    /// runtime の呼び出しが失敗した（unavailable / rejected / timeout）
    Runtime,
    /// 永続層の障害
    Infrastructure,
}

/// ControlError は Manager 層のエラー
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),

    #[error("docker image not found: {0}")]
    ImageNotFound(DockerImageId),

    #[error("uploaded image not found: {0}")]
    UploadedImageNotFound(UploadedImageId),

    #[error("docker image is not active: {0}")]
    ImageInactive(DockerImageId),

    #[error("container {0} has no runtime binding")]
    NoRuntimeBinding(ContainerId),

    #[error("runtime object {runtime_id} for container {container_id} no longer exists; recreate the container")]
    RuntimeObjectMissing {
        container_id: ContainerId,
        runtime_id: String,
    },

    #[error("container {0} is running; stop it before deleting")]
    ContainerBusy(ContainerId),

    #[error("failed to fetch logs for container {container_id}: {source}")]
    LogsUnavailable {
        container_id: ContainerId,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to load image {image}: {reason}")]
    ImageLoadFailed { image: String, reason: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::ContainerNotFound(_)
            | ControlError::ImageNotFound(_)
            | ControlError::UploadedImageNotFound(_) => ErrorKind::NotFound,
            ControlError::ImageInactive(_)
            | ControlError::NoRuntimeBinding(_)
            | ControlError::RuntimeObjectMissing { .. }
            | ControlError::ContainerBusy(_) => ErrorKind::Conflict,
            ControlError::LogsUnavailable { .. }
            | ControlError::ImageLoadFailed { .. }
            | ControlError::Runtime(_) => ErrorKind::Runtime,
            ControlError::Repository(_) => ErrorKind::Infrastructure,
        }
    }
}
