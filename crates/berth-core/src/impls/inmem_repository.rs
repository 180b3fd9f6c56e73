//! InMemory repositories - 開発・テスト用の永続層
//!
//! # 実装詳細
//! - `tokio::sync::RwLock<HashMap<Id, Record>>` で保持
//! - `list` は ID（ULID）順なので作成順に並ぶ
//! - Container / DockerImage リポジトリは update の失敗を注入できる

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{
    Container, ContainerId, ContainerUpdate, DockerImage, DockerImageId, UploadedImage,
    UploadedImageId,
};
use crate::ports::{
    ContainerRepository, DockerImageRepository, RepositoryError, UploadedImageRepository,
};

#[derive(Default)]
pub struct InMemoryContainerRepository {
    records: RwLock<HashMap<ContainerId, Container>>,
    failing_updates: AtomicUsize,
}

impl InMemoryContainerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `update` fail with a backend error.
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }
}

fn injected_failure(failing: &AtomicUsize) -> Result<(), RepositoryError> {
    match failing.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(RepositoryError::Backend("injected update failure".into())),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl ContainerRepository for InMemoryContainerRepository {
    async fn create(&self, container: &Container) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&container.id) {
            return Err(RepositoryError::AlreadyExists(container.id.to_string()));
        }
        records.insert(container.id, container.clone());
        Ok(())
    }

    async fn get(&self, id: ContainerId) -> Result<Option<Container>, RepositoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Container>, RepositoryError> {
        let records = self.records.read().await;
        let mut all: Vec<Container> = records.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        Ok(all)
    }

    async fn update(
        &self,
        id: ContainerId,
        update: &ContainerUpdate,
    ) -> Result<Container, RepositoryError> {
        injected_failure(&self.failing_updates)?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        record.apply(update);
        Ok(record.clone())
    }

    async fn delete(&self, id: ContainerId) -> Result<(), RepositoryError> {
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}

#[derive(Default)]
pub struct InMemoryDockerImageRepository {
    records: RwLock<HashMap<DockerImageId, DockerImage>>,
    failing_updates: AtomicUsize,
}

impl InMemoryDockerImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `update` fail with a backend error.
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DockerImageRepository for InMemoryDockerImageRepository {
    async fn create(&self, image: &DockerImage) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&image.id) {
            return Err(RepositoryError::AlreadyExists(image.id.to_string()));
        }
        records.insert(image.id, image.clone());
        Ok(())
    }

    async fn get(&self, id: DockerImageId) -> Result<Option<DockerImage>, RepositoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<DockerImage>, RepositoryError> {
        let records = self.records.read().await;
        let mut all: Vec<DockerImage> = records.values().cloned().collect();
        all.sort_by_key(|i| i.id);
        Ok(all)
    }

    async fn update(&self, image: &DockerImage) -> Result<(), RepositoryError> {
        injected_failure(&self.failing_updates)?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(&image.id)
            .ok_or_else(|| RepositoryError::NotFound(image.id.to_string()))?;
        *record = image.clone();
        Ok(())
    }

    async fn delete(&self, id: DockerImageId) -> Result<(), RepositoryError> {
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}

#[derive(Default)]
pub struct InMemoryUploadedImageRepository {
    records: RwLock<HashMap<UploadedImageId, UploadedImage>>,
}

impl InMemoryUploadedImageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadedImageRepository for InMemoryUploadedImageRepository {
    async fn create(&self, image: &UploadedImage) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&image.id) {
            return Err(RepositoryError::AlreadyExists(image.id.to_string()));
        }
        records.insert(image.id, image.clone());
        Ok(())
    }

    async fn get(&self, id: UploadedImageId) -> Result<Option<UploadedImage>, RepositoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<UploadedImage>, RepositoryError> {
        let records = self.records.read().await;
        let mut all: Vec<UploadedImage> = records.values().cloned().collect();
        all.sort_by_key(|i| i.id);
        Ok(all)
    }

    async fn update(&self, image: &UploadedImage) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&image.id)
            .ok_or_else(|| RepositoryError::NotFound(image.id.to_string()))?;
        *record = image.clone();
        Ok(())
    }

    async fn delete(&self, id: UploadedImageId) -> Result<(), RepositoryError> {
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContainerImage, ContainerStatus, ResourceLimits, UploadStatus};
    use chrono::Utc;
    use ulid::Ulid;

    fn container() -> Container {
        Container::new_pending(
            ContainerId::from_ulid(Ulid::new()),
            ContainerImage::Reference {
                reference: "nginx:latest".into(),
            },
            ResourceLimits {
                cpu_limit: 0.1,
                memory_limit_mb: 64,
            },
            80,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn container_create_get_update_delete() {
        let repo = InMemoryContainerRepository::new();
        let c = container();

        repo.create(&c).await.unwrap();
        assert_eq!(repo.get(c.id).await.unwrap(), Some(c.clone()));

        let updated = repo
            .update(c.id, &ContainerUpdate::running("abc".into(), Some(8080)))
            .await
            .unwrap();
        assert_eq!(updated.status, ContainerStatus::Running);
        assert_eq!(repo.get(c.id).await.unwrap().unwrap().exposed_port, Some(8080));

        repo.delete(c.id).await.unwrap();
        assert_eq!(repo.get(c.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn container_duplicate_create_is_rejected() {
        let repo = InMemoryContainerRepository::new();
        let c = container();

        repo.create(&c).await.unwrap();
        let err = repo.create(&c).await.unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_of_missing_container_is_not_found() {
        let repo = InMemoryContainerRepository::new();
        let err = repo
            .update(ContainerId::from_ulid(Ulid::new()), &ContainerUpdate::stopped())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_container_update_failure_leaves_record_untouched() {
        let repo = InMemoryContainerRepository::new();
        let c = container();
        repo.create(&c).await.unwrap();
        repo.fail_next_updates(1);

        let err = repo
            .update(c.id, &ContainerUpdate::running("abc".into(), Some(8080)))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Backend(_)));
        assert_eq!(repo.get(c.id).await.unwrap(), Some(c.clone()));

        repo.update(c.id, &ContainerUpdate::stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn list_is_ordered_by_id() {
        let repo = InMemoryContainerRepository::new();
        let a = container();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = container();

        repo.create(&b).await.unwrap();
        repo.create(&a).await.unwrap();

        let ids: Vec<_> = repo.list().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn injected_image_update_failures_run_out() {
        let repo = InMemoryDockerImageRepository::new();
        let image = DockerImage {
            id: DockerImageId::from_ulid(Ulid::new()),
            uploaded_image_id: None,
            name: "web".into(),
            tag: "latest".into(),
            runtime_image_id: "sha256:1".into(),
            is_active: true,
            created_at: Utc::now(),
        };
        repo.create(&image).await.unwrap();
        repo.fail_next_updates(1);

        let mut inactive = image.clone();
        inactive.is_active = false;

        assert!(repo.update(&inactive).await.is_err());
        repo.update(&inactive).await.unwrap();
        assert!(!repo.get(image.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn uploaded_image_update_replaces_record() {
        let repo = InMemoryUploadedImageRepository::new();
        let mut upload = UploadedImage {
            id: UploadedImageId::from_ulid(Ulid::new()),
            filename: "web.tar".into(),
            path: "/tmp/web.tar".into(),
            status: UploadStatus::Pending,
            created_at: Utc::now(),
        };
        repo.create(&upload).await.unwrap();

        upload.status = UploadStatus::Uploaded;
        repo.update(&upload).await.unwrap();

        assert_eq!(
            repo.get(upload.id).await.unwrap().unwrap().status,
            UploadStatus::Uploaded
        );
    }
}
