//! ContainerManager - コンテナのライフサイクル管理
//!
//! # 状態遷移
//! ```text
//! pending → running | failed
//! running ⇄ stopped            (stop / start)
//! running → failed | stopped   (reconcile)
//! pending → failed             (reconcile; create が結果を記録できなかった)
//! ```
//! どの遷移の後でも `status != running` なら `exposed_port` は `None`。
//!
//! # 設計原則
//! - create は runtime の失敗を呼び出し元に返さず、failed として記録する
//! - start / stop の runtime エラー（timeout 含む）は永続状態を変えずに返す
//! - runtime 側で消えたオブジェクト（not-found）は drift として扱う
//! - 変更系の操作と reconcile の補正はコンテナ ID ごとのロックで直列化する
//! - キャッシュは持たない。毎回リポジトリを読み直す

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::app::keyed_lock::KeyedLocks;
use crate::app::status::{ContainerCounts, ReconcileReport};
use crate::domain::{
    Container, ContainerId, ContainerImage, ContainerStatus, ContainerUpdate, ControlError,
    DockerImageId, DomainEvent, ResourceLimits,
};
use crate::ports::{
    Clock, ContainerRepository, DockerImageRepository, EventSink, IdGenerator, RunSpec,
    RuntimeGateway,
};

/// 呼び出し側が省略したときに使う値
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDefaults {
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub internal_port: u16,
    pub log_tail: usize,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            cpu_limit: 0.1,
            memory_limit_mb: 128,
            internal_port: 80,
            log_tail: 100,
        }
    }
}

/// Where a new container gets its image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Free-form runtime reference such as `nginx:latest`.
    Reference(String),
    /// A DockerImage record; it must be active.
    Activated(DockerImageId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateContainer {
    pub image: ImageSource,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u64>,
    pub internal_port: Option<u16>,
    pub host_port: Option<u16>,
}

impl CreateContainer {
    pub fn new(image: ImageSource) -> Self {
        Self {
            image,
            cpu_limit: None,
            memory_limit_mb: None,
            internal_port: None,
            host_port: None,
        }
    }

    pub fn from_reference(reference: impl Into<String>) -> Self {
        Self::new(ImageSource::Reference(reference.into()))
    }

    pub fn from_image(image_id: DockerImageId) -> Self {
        Self::new(ImageSource::Activated(image_id))
    }

    pub fn cpu_limit(mut self, cpu_limit: f64) -> Self {
        self.cpu_limit = Some(cpu_limit);
        self
    }

    pub fn memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = Some(memory_limit_mb);
        self
    }

    pub fn internal_port(mut self, port: u16) -> Self {
        self.internal_port = Some(port);
        self
    }

    pub fn host_port(mut self, port: u16) -> Self {
        self.host_port = Some(port);
        self
    }
}

enum Correction {
    Failed,
    Stopped,
    Refreshed,
}

pub struct ContainerManager {
    containers: Arc<dyn ContainerRepository>,
    images: Arc<dyn DockerImageRepository>,
    runtime: Arc<dyn RuntimeGateway>,
    events: Arc<dyn EventSink>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    defaults: ContainerDefaults,
    locks: KeyedLocks<ContainerId>,
}

impl ContainerManager {
    pub fn new(
        containers: Arc<dyn ContainerRepository>,
        images: Arc<dyn DockerImageRepository>,
        runtime: Arc<dyn RuntimeGateway>,
        events: Arc<dyn EventSink>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        defaults: ContainerDefaults,
    ) -> Self {
        Self {
            containers,
            images,
            runtime,
            events,
            ids,
            clock,
            defaults,
            locks: KeyedLocks::new(),
        }
    }

    pub fn defaults(&self) -> &ContainerDefaults {
        &self.defaults
    }

    /// Persist a pending record, ask the runtime to run it and record the outcome.
    ///
    /// Runtime failures end up as `failed` on the returned record, not as an error.
    /// If the outcome cannot be recorded, the runtime object is removed again and
    /// the repository error is returned.
    pub async fn create(&self, request: CreateContainer) -> Result<Container, ControlError> {
        let image = self.resolve_image(&request.image).await?;
        let limits = ResourceLimits {
            cpu_limit: request.cpu_limit.unwrap_or(self.defaults.cpu_limit),
            memory_limit_mb: request
                .memory_limit_mb
                .unwrap_or(self.defaults.memory_limit_mb),
        };
        let internal_port = request.internal_port.unwrap_or(self.defaults.internal_port);

        let id = self.ids.generate_container_id();
        let _guard = self.locks.lock(id).await;

        let record = Container::new_pending(id, image, limits, internal_port, self.clock.now());
        self.containers.create(&record).await?;
        debug!(container_id = %id, image = record.image.runtime_ref(), "container pending");

        let spec = RunSpec {
            image: record.image.runtime_ref().to_string(),
            internal_port,
            host_port: request.host_port,
            memory_limit_mb: limits.memory_limit_mb,
            cpu_limit: limits.cpu_limit,
        };
        let (update, launched) = match self.runtime.run(&spec).await {
            Ok(outcome) => {
                info!(
                    container_id = %id,
                    runtime_id = %outcome.runtime_id,
                    exposed_port = ?outcome.exposed_port,
                    "container running"
                );
                let update =
                    ContainerUpdate::running(outcome.runtime_id.clone(), outcome.exposed_port);
                (update, Some(outcome.runtime_id))
            }
            Err(e) => {
                error!(container_id = %id, image = %spec.image, error = %e, "deploy failed");
                self.events.emit(DomainEvent::DeployFailed {
                    container_id: id,
                    error: e.to_string(),
                });
                (ContainerUpdate::failed_unbound(), None)
            }
        };

        match self.containers.update(id, &update).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                self.abandon_create(id, launched, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Undo a create whose outcome could not be stored: remove the runtime object
    /// and try once more to leave the record `failed`. Anything still pending is
    /// picked up by the next reconcile pass.
    async fn abandon_create(&self, id: ContainerId, launched: Option<String>, error: &str) {
        error!(container_id = %id, error, "could not record deploy outcome");
        self.events.emit(DomainEvent::DeployFailed {
            container_id: id,
            error: format!("recording deploy outcome failed: {error}"),
        });
        if let Some(runtime_id) = launched {
            self.discard_runtime_object(id, runtime_id).await;
        }
        if let Err(e) = self
            .containers
            .update(id, &ContainerUpdate::failed_unbound())
            .await
        {
            warn!(container_id = %id, error = %e, "container left pending until next reconcile");
        }
    }

    async fn discard_runtime_object(&self, id: ContainerId, runtime_id: String) {
        match self.runtime.remove(&runtime_id).await {
            Ok(()) => debug!(container_id = %id, %runtime_id, "runtime object removed"),
            Err(e) if e.is_not_found() => {
                debug!(container_id = %id, %runtime_id, "runtime object already gone")
            }
            Err(e) => {
                warn!(container_id = %id, %runtime_id, error = %e, "runtime cleanup failed");
                self.events.emit(DomainEvent::CleanupFailed {
                    container_id: id,
                    runtime_id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Start a stopped container again. Already running is a no-op.
    pub async fn start(&self, id: ContainerId) -> Result<Container, ControlError> {
        let _guard = self.locks.lock(id).await;
        let container = self.fetch(id).await?;
        if container.status.is_running() {
            return Ok(container);
        }
        let runtime_id = container
            .runtime_id
            .clone()
            .ok_or(ControlError::NoRuntimeBinding(id))?;

        let hinted = match self.runtime.start(&runtime_id).await {
            Ok(port) => port,
            Err(e) if e.is_not_found() => {
                return Err(ControlError::RuntimeObjectMissing {
                    container_id: id,
                    runtime_id,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let exposed_port = match self
            .runtime
            .exposed_port(&runtime_id, container.internal_port)
            .await
        {
            Ok(Some(port)) => Some(port),
            Ok(None) => hinted,
            Err(e) => {
                warn!(container_id = %id, error = %e, "could not read exposed port after start");
                hinted
            }
        };

        let updated = self
            .containers
            .update(id, &ContainerUpdate::running(runtime_id, exposed_port))
            .await?;
        info!(container_id = %id, ?exposed_port, "container started");
        Ok(updated)
    }

    /// Stop a running container. Anything not running is a no-op.
    pub async fn stop(&self, id: ContainerId) -> Result<Container, ControlError> {
        let _guard = self.locks.lock(id).await;
        let container = self.fetch(id).await?;
        if !container.status.is_running() {
            return Ok(container);
        }
        let runtime_id = container
            .runtime_id
            .clone()
            .ok_or(ControlError::NoRuntimeBinding(id))?;

        let update = match self.runtime.stop(&runtime_id).await {
            Ok(()) => ContainerUpdate::stopped(),
            Err(e) if e.is_not_found() => {
                warn!(container_id = %id, %runtime_id, "runtime object already gone; treating as stopped");
                self.events.emit(DomainEvent::DriftAbsorbed {
                    container_id: id,
                    runtime_id,
                });
                ContainerUpdate::stopped_unbound()
            }
            Err(e) => return Err(e.into()),
        };

        let updated = self.containers.update(id, &update).await?;
        info!(container_id = %id, "container stopped");
        Ok(updated)
    }

    /// Delete a non-running container. Runtime cleanup is best effort.
    pub async fn delete(&self, id: ContainerId) -> Result<(), ControlError> {
        let _guard = self.locks.lock(id).await;
        let container = self.fetch(id).await?;
        if container.status.is_running() {
            return Err(ControlError::ContainerBusy(id));
        }

        if let Some(runtime_id) = container.runtime_id {
            self.discard_runtime_object(id, runtime_id).await;
        }

        self.containers.delete(id).await?;
        info!(container_id = %id, "container deleted");
        Ok(())
    }

    /// Fetch the last `tail` log lines (configured default when `None`).
    pub async fn logs(&self, id: ContainerId, tail: Option<usize>) -> Result<String, ControlError> {
        let container = self.fetch(id).await?;
        let runtime_id = container
            .runtime_id
            .ok_or(ControlError::NoRuntimeBinding(id))?;
        self.runtime
            .logs(&runtime_id, tail.unwrap_or(self.defaults.log_tail))
            .await
            .map_err(|source| ControlError::LogsUnavailable {
                container_id: id,
                source,
            })
    }

    pub async fn get(&self, id: ContainerId) -> Result<Container, ControlError> {
        self.fetch(id).await
    }

    pub async fn list(&self) -> Result<Vec<Container>, ControlError> {
        Ok(self.containers.list().await?)
    }

    pub async fn counts(&self) -> Result<ContainerCounts, ControlError> {
        let all = self.containers.list().await?;
        Ok(ContainerCounts::tally(&all))
    }

    /// One full reconciliation pass over every running record. Records left
    /// `pending` by an interrupted create are failed on the same pass.
    pub async fn reconcile_running(&self) -> Result<ReconcileReport, ControlError> {
        self.reconcile_running_until(|| false).await
    }

    /// Like [`reconcile_running`](Self::reconcile_running), but checks
    /// `should_stop` before each container and returns early when it is true.
    pub async fn reconcile_running_until(
        &self,
        should_stop: impl Fn() -> bool,
    ) -> Result<ReconcileReport, ControlError> {
        let candidates: Vec<ContainerId> = self
            .containers
            .list()
            .await?
            .into_iter()
            .filter(|c| c.status.is_running() || c.status == ContainerStatus::Pending)
            .map(|c| c.id)
            .collect();

        let mut report = ReconcileReport::default();
        for id in candidates {
            if should_stop() {
                debug!("reconcile pass interrupted by shutdown");
                break;
            }
            report.checked += 1;
            match self.reconcile_one(id).await {
                Ok(None) => {}
                Ok(Some(Correction::Failed)) => report.failed += 1,
                Ok(Some(Correction::Stopped)) => report.stopped += 1,
                Ok(Some(Correction::Refreshed)) => report.refreshed += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(container_id = %id, error = %e, "reconcile failed for container");
                    self.events.emit(DomainEvent::ReconcileItemFailed {
                        container_id: id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn reconcile_one(&self, id: ContainerId) -> Result<Option<Correction>, ControlError> {
        let _guard = self.locks.lock(id).await;
        // 一覧取得後に stop / delete された可能性がある
        let Some(container) = self.containers.get(id).await? else {
            return Ok(None);
        };
        // create は完了までロックを持つので、ここで見える pending は放棄されたもの
        if container.status == ContainerStatus::Pending {
            if let Some(runtime_id) = container.runtime_id.clone() {
                self.discard_runtime_object(id, runtime_id).await;
            }
            self.mark(&container, ContainerStatus::Failed, "create did not complete")
                .await?;
            return Ok(Some(Correction::Failed));
        }
        if !container.status.is_running() {
            return Ok(None);
        }

        let Some(runtime_id) = container.runtime_id.clone() else {
            self.mark(&container, ContainerStatus::Failed, "running without a runtime id")
                .await?;
            return Ok(Some(Correction::Failed));
        };

        match self.runtime.status(&runtime_id).await? {
            None => {
                self.mark(&container, ContainerStatus::Failed, "runtime instance missing")
                    .await?;
                Ok(Some(Correction::Failed))
            }
            Some(state) if !state.is_running() => {
                let reason = format!("runtime reports {state:?}");
                self.mark(&container, ContainerStatus::Stopped, &reason)
                    .await?;
                Ok(Some(Correction::Stopped))
            }
            Some(_) => {
                let port = self
                    .runtime
                    .exposed_port(&runtime_id, container.internal_port)
                    .await?;
                if port == container.exposed_port {
                    return Ok(None);
                }
                self.containers
                    .update(id, &ContainerUpdate::exposed_port(port))
                    .await?;
                info!(
                    container_id = %id,
                    from = ?container.exposed_port,
                    to = ?port,
                    "exposed port refreshed"
                );
                Ok(Some(Correction::Refreshed))
            }
        }
    }

    async fn mark(
        &self,
        container: &Container,
        to: ContainerStatus,
        reason: &str,
    ) -> Result<(), ControlError> {
        let id = container.id;
        let update = match to {
            ContainerStatus::Failed => ContainerUpdate::failed_unbound(),
            _ => ContainerUpdate::stopped(),
        };
        self.containers.update(id, &update).await?;
        warn!(container_id = %id, from = %container.status, %to, reason, "drift corrected");
        self.events.emit(DomainEvent::DriftCorrected {
            container_id: id,
            from: container.status,
            to,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn fetch(&self, id: ContainerId) -> Result<Container, ControlError> {
        self.containers
            .get(id)
            .await?
            .ok_or(ControlError::ContainerNotFound(id))
    }

    async fn resolve_image(&self, source: &ImageSource) -> Result<ContainerImage, ControlError> {
        match source {
            ImageSource::Reference(reference) => Ok(ContainerImage::Reference {
                reference: reference.clone(),
            }),
            ImageSource::Activated(image_id) => {
                let image = self
                    .images
                    .get(*image_id)
                    .await?
                    .ok_or(ControlError::ImageNotFound(*image_id))?;
                if !image.is_active {
                    return Err(ControlError::ImageInactive(*image_id));
                }
                Ok(ContainerImage::Managed {
                    image_id: image.id,
                    runtime_image_id: image.runtime_image_id,
                })
            }
        }
    }
}
