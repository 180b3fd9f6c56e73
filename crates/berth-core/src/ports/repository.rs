//! Repository ports - 永続層の契約
//!
//! 3 つのリポジトリは互いに独立しています。スキーマやクエリの実装はこのクレートの外にあり、
//! ここでは契約だけを定義します。開発・テスト用の実装は `impls::inmem_repository` にあります。
//!
//! # 設計原則
//! - 永続層が source of truth（正本）。Manager はキャッシュを持たず毎回読み直す
//! - `get` は存在しない場合 `Ok(None)` を返す（エラーにしない）

use async_trait::async_trait;

use crate::domain::{
    Container, ContainerId, ContainerUpdate, DockerImage, DockerImageId, UploadedImage,
    UploadedImageId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ContainerRepository: Send + Sync {
    async fn create(&self, container: &Container) -> Result<(), RepositoryError>;

    async fn get(&self, id: ContainerId) -> Result<Option<Container>, RepositoryError>;

    async fn list(&self) -> Result<Vec<Container>, RepositoryError>;

    /// Apply a partial update and return the record as stored afterwards.
    async fn update(
        &self,
        id: ContainerId,
        update: &ContainerUpdate,
    ) -> Result<Container, RepositoryError>;

    async fn delete(&self, id: ContainerId) -> Result<(), RepositoryError>;
}

/// Listing must be supported so activation can find siblings sharing (name, tag).
#[async_trait]
pub trait DockerImageRepository: Send + Sync {
    async fn create(&self, image: &DockerImage) -> Result<(), RepositoryError>;

    async fn get(&self, id: DockerImageId) -> Result<Option<DockerImage>, RepositoryError>;

    async fn list(&self) -> Result<Vec<DockerImage>, RepositoryError>;

    /// Replace the full record.
    async fn update(&self, image: &DockerImage) -> Result<(), RepositoryError>;

    async fn delete(&self, id: DockerImageId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait UploadedImageRepository: Send + Sync {
    async fn create(&self, image: &UploadedImage) -> Result<(), RepositoryError>;

    async fn get(&self, id: UploadedImageId) -> Result<Option<UploadedImage>, RepositoryError>;

    async fn list(&self) -> Result<Vec<UploadedImage>, RepositoryError>;

    async fn update(&self, image: &UploadedImage) -> Result<(), RepositoryError>;

    async fn delete(&self, id: UploadedImageId) -> Result<(), RepositoryError>;
}
