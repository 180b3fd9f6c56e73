//! ImageActivationManager - (name, tag) ごとの active イメージ管理
//!
//! # 不変条件
//! 任意の時点で、同じ (name, tag) の DockerImage のうち `is_active = true` は高々 1 件。
//! 一時的に 0 件になるのは許容する（2 件は許容しない）。
//!
//! # 実装詳細
//! - ロック順は固定: UploadedImage キー → (name, tag) キー
//! - sibling の非活性化は 1 件ずつ、それぞれ RetryPolicy で再試行する
//! - sibling を非活性化できなければ target を active にせず中断する
//! - load の失敗時は UploadedImage の status を変更しない

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::app::keyed_lock::KeyedLocks;
use crate::app::retry::RetryPolicy;
use crate::domain::{
    ControlError, DockerImage, DockerImageId, DomainEvent, ImageIdentity, UploadStatus,
    UploadedImage, UploadedImageId,
};
use crate::ports::{
    Clock, DockerImageRepository, EventSink, IdGenerator, RuntimeGateway, UploadedImageRepository,
};

pub struct ImageActivationManager {
    uploads: Arc<dyn UploadedImageRepository>,
    images: Arc<dyn DockerImageRepository>,
    runtime: Arc<dyn RuntimeGateway>,
    events: Arc<dyn EventSink>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    upload_locks: KeyedLocks<UploadedImageId>,
    identity_locks: KeyedLocks<ImageIdentity>,
}

impl ImageActivationManager {
    pub fn new(
        uploads: Arc<dyn UploadedImageRepository>,
        images: Arc<dyn DockerImageRepository>,
        runtime: Arc<dyn RuntimeGateway>,
        events: Arc<dyn EventSink>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            uploads,
            images,
            runtime,
            events,
            ids,
            clock,
            retry,
            upload_locks: KeyedLocks::new(),
            identity_locks: KeyedLocks::new(),
        }
    }

    /// Load an uploaded tarball into the runtime and make it the active image
    /// of its (name, tag).
    ///
    /// If a DockerImage for this upload is already active it is returned
    /// unchanged without touching the runtime.
    pub async fn load_and_activate(
        &self,
        upload_id: UploadedImageId,
    ) -> Result<DockerImage, ControlError> {
        let upload = self.fetch_upload(upload_id).await?;
        let identity = upload.identity();

        let _upload_guard = self.upload_locks.lock(upload_id).await;
        let _identity_guard = self.identity_locks.lock(identity.clone()).await;

        let existing = self
            .images
            .list()
            .await?
            .into_iter()
            .filter(|i| i.uploaded_image_id == Some(upload_id))
            .max_by_key(|i| i.id);
        if let Some(image) = &existing {
            if image.is_active {
                debug!(image_id = %image.id, %identity, "image already active");
                return Ok(image.clone());
            }
        }

        // 待っている間に status が変わっている可能性があるので読み直す
        let upload = self.fetch_upload(upload_id).await?;
        let runtime_image_id = self.load(&upload, &identity).await?;

        let target = match existing {
            Some(mut image) => {
                image.runtime_image_id = runtime_image_id;
                image
            }
            None => {
                let image = DockerImage {
                    id: self.ids.generate_docker_image_id(),
                    uploaded_image_id: Some(upload_id),
                    name: identity.name.clone(),
                    tag: identity.tag.clone(),
                    runtime_image_id,
                    is_active: false,
                    created_at: self.clock.now(),
                };
                self.images.create(&image).await?;
                image
            }
        };

        self.promote(target, &identity).await
    }

    /// Make an existing DockerImage the active one for its (name, tag).
    ///
    /// Reloads from the linked upload when the runtime no longer has the image.
    pub async fn activate(&self, image_id: DockerImageId) -> Result<DockerImage, ControlError> {
        let image = self.fetch_image(image_id).await?;
        let identity = image.identity();

        let _upload_guard = match image.uploaded_image_id {
            Some(upload_id) => Some(self.upload_locks.lock(upload_id).await),
            None => None,
        };
        let _identity_guard = self.identity_locks.lock(identity.clone()).await;

        let mut image = self.fetch_image(image_id).await?;
        if image.is_active {
            return Ok(image);
        }

        if !self.runtime.image_exists(&image.runtime_image_id).await? {
            let Some(upload_id) = image.uploaded_image_id else {
                return Err(ControlError::ImageLoadFailed {
                    image: identity.to_string(),
                    reason: "runtime no longer has the image and no upload is linked".into(),
                });
            };
            warn!(image_id = %image.id, %identity, "runtime lost image; reloading from upload");
            let upload = self.fetch_upload(upload_id).await?;
            image.runtime_image_id = self.load(&upload, &identity).await?;
        }

        self.promote(image, &identity).await
    }

    /// Clear the active flag. The record and the runtime image stay.
    pub async fn deactivate(&self, image_id: DockerImageId) -> Result<DockerImage, ControlError> {
        let image = self.fetch_image(image_id).await?;
        let identity = image.identity();
        let _identity_guard = self.identity_locks.lock(identity.clone()).await;

        let mut image = self.fetch_image(image_id).await?;
        if !image.is_active {
            return Ok(image);
        }
        image.is_active = false;
        self.persist(&image).await?;
        info!(image_id = %image.id, %identity, "image deactivated");
        self.events.emit(DomainEvent::ImageDeactivated {
            image_id: image.id,
            identity,
        });
        Ok(image)
    }

    /// Remove runtime images of inactive records of `identity`.
    /// Records are kept. Returns the number of runtime images removed.
    pub async fn prune_runtime_images(
        &self,
        identity: &ImageIdentity,
    ) -> Result<usize, ControlError> {
        let _identity_guard = self.identity_locks.lock(identity.clone()).await;

        let rows: Vec<DockerImage> = self
            .images
            .list()
            .await?
            .into_iter()
            .filter(|i| i.has_identity(identity))
            .collect();
        let in_use: HashSet<&str> = rows
            .iter()
            .filter(|i| i.is_active)
            .map(|i| i.runtime_image_id.as_str())
            .collect();
        let mut candidates: Vec<&str> = rows
            .iter()
            .filter(|i| !i.is_active)
            .map(|i| i.runtime_image_id.as_str())
            .filter(|id| !in_use.contains(id))
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let mut removed = 0;
        for runtime_image_id in candidates {
            match self.runtime.remove_image(runtime_image_id).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(%identity, runtime_image_id, error = %e, "could not remove runtime image")
                }
            }
        }
        info!(%identity, removed, "runtime images pruned");
        Ok(removed)
    }

    pub async fn get_image(&self, image_id: DockerImageId) -> Result<DockerImage, ControlError> {
        self.fetch_image(image_id).await
    }

    pub async fn list_images(&self) -> Result<Vec<DockerImage>, ControlError> {
        Ok(self.images.list().await?)
    }

    pub async fn active_image(
        &self,
        identity: &ImageIdentity,
    ) -> Result<Option<DockerImage>, ControlError> {
        Ok(self
            .images
            .list()
            .await?
            .into_iter()
            .find(|i| i.is_active && i.has_identity(identity)))
    }

    /// Uploaded tarballs, oldest first. `latest_only` keeps the newest per filename.
    pub async fn list_uploaded(
        &self,
        latest_only: bool,
    ) -> Result<Vec<UploadedImage>, ControlError> {
        let all = self.uploads.list().await?;
        if !latest_only {
            return Ok(all);
        }
        let mut newest: BTreeMap<String, UploadedImage> = BTreeMap::new();
        for upload in all {
            let replace = newest
                .get(&upload.filename)
                .is_none_or(|seen| (upload.created_at, upload.id) > (seen.created_at, seen.id));
            if replace {
                newest.insert(upload.filename.clone(), upload);
            }
        }
        let mut latest: Vec<UploadedImage> = newest.into_values().collect();
        latest.sort_by_key(|u| u.id);
        Ok(latest)
    }

    /// Deactivate every other active sibling, then persist `target` as active.
    /// Caller holds the identity lock.
    async fn promote(
        &self,
        mut target: DockerImage,
        identity: &ImageIdentity,
    ) -> Result<DockerImage, ControlError> {
        let siblings: Vec<DockerImage> = self
            .images
            .list()
            .await?
            .into_iter()
            .filter(|i| i.id != target.id && i.is_active && i.has_identity(identity))
            .collect();

        for mut sibling in siblings {
            sibling.is_active = false;
            if let Err(e) = self.persist(&sibling).await {
                error!(
                    image_id = %sibling.id,
                    %identity,
                    error = %e,
                    "could not deactivate sibling; activation aborted"
                );
                return Err(e);
            }
            info!(image_id = %sibling.id, %identity, "image superseded");
            self.events.emit(DomainEvent::ImageDeactivated {
                image_id: sibling.id,
                identity: identity.clone(),
            });
        }

        target.is_active = true;
        self.persist(&target).await?;
        info!(
            image_id = %target.id,
            %identity,
            runtime_image_id = %target.runtime_image_id,
            "image activated"
        );
        self.events.emit(DomainEvent::ImageActivated {
            image_id: target.id,
            identity: identity.clone(),
            runtime_image_id: target.runtime_image_id.clone(),
        });
        Ok(target)
    }

    async fn persist(&self, image: &DockerImage) -> Result<(), ControlError> {
        let images = &self.images;
        self.retry
            .run("update docker image", move || async move {
                images.update(image).await
            })
            .await?;
        Ok(())
    }

    /// Load `upload` into the runtime; a pending upload becomes uploaded.
    async fn load(
        &self,
        upload: &UploadedImage,
        identity: &ImageIdentity,
    ) -> Result<String, ControlError> {
        let runtime_image_id = match self.runtime.load_image(&upload.path).await {
            Ok(id) => id,
            Err(e) => {
                error!(upload_id = %upload.id, %identity, error = %e, "image load failed");
                self.events.emit(DomainEvent::ImageLoadFailed {
                    uploaded_image_id: Some(upload.id),
                    identity: identity.clone(),
                    error: e.to_string(),
                });
                return Err(ControlError::ImageLoadFailed {
                    image: identity.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        info!(upload_id = %upload.id, %identity, %runtime_image_id, "image loaded");

        if upload.status == UploadStatus::Pending {
            let mut uploaded = upload.clone();
            uploaded.status = UploadStatus::Uploaded;
            self.uploads.update(&uploaded).await?;
        }
        Ok(runtime_image_id)
    }

    async fn fetch_upload(&self, id: UploadedImageId) -> Result<UploadedImage, ControlError> {
        self.uploads
            .get(id)
            .await?
            .ok_or(ControlError::UploadedImageNotFound(id))
    }

    async fn fetch_image(&self, id: DockerImageId) -> Result<DockerImage, ControlError> {
        self.images
            .get(id)
            .await?
            .ok_or(ControlError::ImageNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use crate::impls::{
        InMemoryDockerImageRepository, InMemoryEventLog, InMemoryRuntime,
        InMemoryUploadedImageRepository,
    };
    use crate::ports::{RuntimeError, SystemClock, UlidGenerator};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use ulid::Ulid;

    struct Harness {
        manager: Arc<ImageActivationManager>,
        runtime: Arc<InMemoryRuntime>,
        uploads: Arc<InMemoryUploadedImageRepository>,
        images: Arc<InMemoryDockerImageRepository>,
        events: Arc<InMemoryEventLog>,
    }

    fn harness() -> Harness {
        let runtime = Arc::new(InMemoryRuntime::new());
        let uploads = Arc::new(InMemoryUploadedImageRepository::new());
        let images = Arc::new(InMemoryDockerImageRepository::new());
        let events = Arc::new(InMemoryEventLog::new());
        let manager = Arc::new(ImageActivationManager::new(
            uploads.clone(),
            images.clone(),
            runtime.clone(),
            events.clone(),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
            RetryPolicy::new(3, Duration::from_millis(1)),
        ));
        Harness {
            manager,
            runtime,
            uploads,
            images,
            events,
        }
    }

    async fn upload(h: &Harness, filename: &str) -> UploadedImage {
        let upload = UploadedImage {
            id: UploadedImageId::from_ulid(Ulid::new()),
            filename: filename.into(),
            path: format!("/var/lib/berth/uploads/{filename}"),
            status: UploadStatus::Pending,
            created_at: Utc::now(),
        };
        h.uploads.create(&upload).await.unwrap();
        upload
    }

    async fn active_count(h: &Harness, identity: &ImageIdentity) -> usize {
        h.manager
            .list_images()
            .await
            .unwrap()
            .iter()
            .filter(|i| i.is_active && i.has_identity(identity))
            .count()
    }

    #[tokio::test]
    async fn first_load_creates_active_image_and_marks_upload() {
        let h = harness();
        let u = upload(&h, "web:1.0.tar").await;

        let image = h.manager.load_and_activate(u.id).await.unwrap();

        assert!(image.is_active);
        assert_eq!(image.identity(), ImageIdentity::new("web", "1.0"));
        assert_eq!(image.uploaded_image_id, Some(u.id));
        assert!(h.runtime.has_image(&image.runtime_image_id));
        assert_eq!(
            h.uploads.get(u.id).await.unwrap().unwrap().status,
            UploadStatus::Uploaded
        );
    }

    #[tokio::test]
    async fn reactivating_active_upload_makes_no_load_call() {
        let h = harness();
        let u = upload(&h, "web.tar").await;
        let first = h.manager.load_and_activate(u.id).await.unwrap();

        let again = h.manager.load_and_activate(u.id).await.unwrap();

        assert_eq!(again, first);
        assert_eq!(h.runtime.load_calls(), 1);
    }

    #[tokio::test]
    async fn newer_upload_supersedes_older_one() {
        let h = harness();
        let identity = ImageIdentity::new("web", "latest");
        let old = upload(&h, "web.tar").await;
        let new = upload(&h, "web.tar").await;

        let old_image = h.manager.load_and_activate(old.id).await.unwrap();
        let new_image = h.manager.load_and_activate(new.id).await.unwrap();

        assert_ne!(old_image.id, new_image.id);
        assert!(!h.manager.get_image(old_image.id).await.unwrap().is_active);
        assert_eq!(
            h.manager.active_image(&identity).await.unwrap().map(|i| i.id),
            Some(new_image.id)
        );
        assert_eq!(active_count(&h, &identity).await, 1);
    }

    #[tokio::test]
    async fn other_tags_are_left_alone() {
        let h = harness();
        let a = upload(&h, "web:1.tar").await;
        let b = upload(&h, "web:2.tar").await;

        let first = h.manager.load_and_activate(a.id).await.unwrap();
        h.manager.load_and_activate(b.id).await.unwrap();

        assert!(h.manager.get_image(first.id).await.unwrap().is_active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_activation_of_same_upload_loads_once() {
        let h = harness();
        h.runtime.set_load_delay(Duration::from_millis(50));
        let u = upload(&h, "web.tar").await;

        let a = tokio::spawn({
            let m = Arc::clone(&h.manager);
            async move { m.load_and_activate(u.id).await }
        });
        let b = tokio::spawn({
            let m = Arc::clone(&h.manager);
            async move { m.load_and_activate(u.id).await }
        });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(h.runtime.load_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_of_same_identity_leave_one_active() {
        let h = harness();
        let identity = ImageIdentity::new("api", "2");
        let mut uploads = Vec::new();
        for _ in 0..6 {
            uploads.push(upload(&h, "api:2.tar").await);
        }

        let tasks: Vec<_> = uploads
            .iter()
            .map(|u| {
                let m = Arc::clone(&h.manager);
                let id = u.id;
                tokio::spawn(async move { m.load_and_activate(id).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(active_count(&h, &identity).await, 1);
        assert_eq!(h.manager.list_images().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn load_failure_keeps_upload_status() {
        let h = harness();
        let u = upload(&h, "web.tar").await;
        h.runtime
            .fail_next_load(RuntimeError::Rejected("corrupt tarball".into()));

        let err = h.manager.load_and_activate(u.id).await.unwrap_err();

        assert!(matches!(err, ControlError::ImageLoadFailed { .. }));
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(
            h.uploads.get(u.id).await.unwrap().unwrap().status,
            UploadStatus::Pending
        );
        assert!(h.manager.list_images().await.unwrap().is_empty());
        assert!(matches!(
            h.events.events().as_slice(),
            [DomainEvent::ImageLoadFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn sibling_deactivation_is_retried() {
        let h = harness();
        let old = upload(&h, "web.tar").await;
        let new = upload(&h, "web.tar").await;
        let old_image = h.manager.load_and_activate(old.id).await.unwrap();
        h.images.fail_next_updates(2);

        let new_image = h.manager.load_and_activate(new.id).await.unwrap();

        assert!(new_image.is_active);
        assert!(!h.manager.get_image(old_image.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn exhausted_retries_abort_without_two_active() {
        let h = harness();
        let identity = ImageIdentity::new("web", "latest");
        let old = upload(&h, "web.tar").await;
        let new = upload(&h, "web.tar").await;
        let old_image = h.manager.load_and_activate(old.id).await.unwrap();
        h.images.fail_next_updates(3);

        let err = h.manager.load_and_activate(new.id).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(active_count(&h, &identity).await, 1);
        assert_eq!(
            h.manager.active_image(&identity).await.unwrap().map(|i| i.id),
            Some(old_image.id)
        );
    }

    #[tokio::test]
    async fn activate_switches_back_without_loading() {
        let h = harness();
        let old = upload(&h, "web.tar").await;
        let new = upload(&h, "web.tar").await;
        let old_image = h.manager.load_and_activate(old.id).await.unwrap();
        let new_image = h.manager.load_and_activate(new.id).await.unwrap();

        let back = h.manager.activate(old_image.id).await.unwrap();

        assert!(back.is_active);
        assert_eq!(back.runtime_image_id, old_image.runtime_image_id);
        assert!(!h.manager.get_image(new_image.id).await.unwrap().is_active);
        assert_eq!(h.runtime.load_calls(), 2);
    }

    #[tokio::test]
    async fn activate_reloads_image_lost_by_runtime() {
        let h = harness();
        let old = upload(&h, "web.tar").await;
        let new = upload(&h, "web.tar").await;
        let old_image = h.manager.load_and_activate(old.id).await.unwrap();
        h.manager.load_and_activate(new.id).await.unwrap();
        h.runtime.forget_image(&old_image.runtime_image_id);

        let back = h.manager.activate(old_image.id).await.unwrap();

        assert!(back.is_active);
        assert_ne!(back.runtime_image_id, old_image.runtime_image_id);
        assert!(h.runtime.has_image(&back.runtime_image_id));
        assert_eq!(h.runtime.load_calls(), 3);
    }

    #[tokio::test]
    async fn activate_without_upload_link_cannot_reload() {
        let h = harness();
        let image = DockerImage {
            id: DockerImageId::from_ulid(Ulid::new()),
            uploaded_image_id: None,
            name: "web".into(),
            tag: "latest".into(),
            runtime_image_id: "sha256:gone".into(),
            is_active: false,
            created_at: Utc::now(),
        };
        h.images.create(&image).await.unwrap();

        let err = h.manager.activate(image.id).await.unwrap_err();

        assert!(matches!(err, ControlError::ImageLoadFailed { .. }));
    }

    #[tokio::test]
    async fn deactivate_clears_flag_and_keeps_record() {
        let h = harness();
        let u = upload(&h, "web.tar").await;
        let image = h.manager.load_and_activate(u.id).await.unwrap();

        let off = h.manager.deactivate(image.id).await.unwrap();

        assert!(!off.is_active);
        assert_eq!(h.manager.list_images().await.unwrap().len(), 1);
        assert!(h.runtime.has_image(&image.runtime_image_id));
    }

    #[tokio::test]
    async fn reloading_deactivated_upload_loads_again() {
        let h = harness();
        let u = upload(&h, "web.tar").await;
        let image = h.manager.load_and_activate(u.id).await.unwrap();
        h.manager.deactivate(image.id).await.unwrap();

        let again = h.manager.load_and_activate(u.id).await.unwrap();

        assert_eq!(again.id, image.id);
        assert!(again.is_active);
        assert_eq!(h.runtime.load_calls(), 2);
    }

    #[tokio::test]
    async fn prune_removes_only_inactive_runtime_images() {
        let h = harness();
        let identity = ImageIdentity::new("web", "latest");
        let old = upload(&h, "web.tar").await;
        let new = upload(&h, "web.tar").await;
        let old_image = h.manager.load_and_activate(old.id).await.unwrap();
        let new_image = h.manager.load_and_activate(new.id).await.unwrap();

        let removed = h.manager.prune_runtime_images(&identity).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!h.runtime.has_image(&old_image.runtime_image_id));
        assert!(h.runtime.has_image(&new_image.runtime_image_id));
        assert_eq!(h.manager.list_images().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_uploaded_latest_only_keeps_newest_per_filename() {
        let h = harness();
        let now = Utc::now();
        let mut created = Vec::new();
        for (filename, age) in [("web.tar", 10), ("web.tar", 5), ("api.tar", 1)] {
            let u = UploadedImage {
                id: UploadedImageId::from_ulid(Ulid::new()),
                filename: filename.into(),
                path: format!("/tmp/{filename}"),
                status: UploadStatus::Uploaded,
                created_at: now - ChronoDuration::minutes(age),
            };
            h.uploads.create(&u).await.unwrap();
            created.push(u);
        }

        let all = h.manager.list_uploaded(false).await.unwrap();
        let latest = h.manager.list_uploaded(true).await.unwrap();

        assert_eq!(all.len(), 3);
        let mut latest_ids: Vec<_> = latest.iter().map(|u| u.id).collect();
        latest_ids.sort();
        let mut expected = vec![created[1].id, created[2].id];
        expected.sort();
        assert_eq!(latest_ids, expected);
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let h = harness();

        let err = h
            .manager
            .load_and_activate(UploadedImageId::from_ulid(Ulid::new()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
