//! ControlPlaneBuilder - コントロールプレーンの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - runtime gateway と 3 つのリポジトリは必須
//! - build() 時に不足があれば BuildError を返す
//! - Clock / IdGenerator / EventSink は省略時に既定の実装を使う

use std::sync::Arc;
use std::time::Duration;

use crate::app::container_manager::{ContainerDefaults, ContainerManager};
use crate::app::image_manager::ImageActivationManager;
use crate::app::reconcile_loop::{ReconcileHandle, ReconcileLoop};
use crate::app::retry::RetryPolicy;
use crate::config::BerthConfig;
use crate::impls::{
    InMemoryContainerRepository, InMemoryDockerImageRepository, InMemoryUploadedImageRepository,
};
use crate::ports::{
    Clock, ContainerRepository, DockerImageRepository, EventSink, IdGenerator, NoopEventSink,
    RuntimeGateway, SystemClock, UlidGenerator, UploadedImageRepository,
};

/// BuildError はコントロールプレーン構築時のエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing component: {0}")]
    Missing(&'static str),
}

/// # 使用例
/// ```ignore
/// let plane = ControlPlaneBuilder::from_config(&config)
///     .runtime(Arc::new(gateway))
///     .in_memory_repositories()
///     .build()?;
/// let reconcile = plane.spawn_reconcile();
/// ```
pub struct ControlPlaneBuilder {
    runtime: Option<Arc<dyn RuntimeGateway>>,
    containers: Option<Arc<dyn ContainerRepository>>,
    docker_images: Option<Arc<dyn DockerImageRepository>>,
    uploads: Option<Arc<dyn UploadedImageRepository>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    defaults: ContainerDefaults,
    retry: RetryPolicy,
    reconcile_interval: Duration,
}

impl ControlPlaneBuilder {
    pub fn new() -> Self {
        Self {
            runtime: None,
            containers: None,
            docker_images: None,
            uploads: None,
            events: None,
            clock: None,
            ids: None,
            defaults: ContainerDefaults::default(),
            retry: RetryPolicy::default(),
            reconcile_interval: Duration::from_secs(10),
        }
    }

    /// Builder pre-filled with the tunables of `config`.
    pub fn from_config(config: &BerthConfig) -> Self {
        Self::new()
            .defaults(config.container_defaults())
            .retry(config.retry_policy())
            .reconcile_interval(config.reconcile_interval())
    }

    pub fn runtime(mut self, runtime: Arc<dyn RuntimeGateway>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn containers(mut self, repo: Arc<dyn ContainerRepository>) -> Self {
        self.containers = Some(repo);
        self
    }

    pub fn docker_images(mut self, repo: Arc<dyn DockerImageRepository>) -> Self {
        self.docker_images = Some(repo);
        self
    }

    pub fn uploads(mut self, repo: Arc<dyn UploadedImageRepository>) -> Self {
        self.uploads = Some(repo);
        self
    }

    /// Use fresh in-memory adapters for all three repositories.
    pub fn in_memory_repositories(self) -> Self {
        self.containers(Arc::new(InMemoryContainerRepository::new()))
            .docker_images(Arc::new(InMemoryDockerImageRepository::new()))
            .uploads(Arc::new(InMemoryUploadedImageRepository::new()))
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn defaults(mut self, defaults: ContainerDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn build(self) -> Result<ControlPlane, BuildError> {
        let runtime = self.runtime.ok_or(BuildError::Missing("runtime gateway"))?;
        let containers = self
            .containers
            .ok_or(BuildError::Missing("container repository"))?;
        let docker_images = self
            .docker_images
            .ok_or(BuildError::Missing("docker image repository"))?;
        let uploads = self
            .uploads
            .ok_or(BuildError::Missing("uploaded image repository"))?;
        let events = self.events.unwrap_or_else(|| Arc::new(NoopEventSink));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock)));

        let container_manager = ContainerManager::new(
            containers,
            Arc::clone(&docker_images),
            Arc::clone(&runtime),
            Arc::clone(&events),
            Arc::clone(&ids),
            Arc::clone(&clock),
            self.defaults,
        );
        let image_manager = ImageActivationManager::new(
            uploads,
            docker_images,
            runtime,
            Arc::clone(&events),
            ids,
            clock,
            self.retry,
        );

        Ok(ControlPlane {
            containers: Arc::new(container_manager),
            images: Arc::new(image_manager),
            events,
            reconcile_interval: self.reconcile_interval,
        })
    }
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 組み立て済みのコントロールプレーン
pub struct ControlPlane {
    pub containers: Arc<ContainerManager>,
    pub images: Arc<ImageActivationManager>,
    events: Arc<dyn EventSink>,
    reconcile_interval: Duration,
}

impl ControlPlane {
    /// Start the background reconcile loop with the configured interval.
    #[must_use = "dropping the handle stops the reconcile loop"]
    pub fn spawn_reconcile(&self) -> ReconcileHandle {
        ReconcileLoop::spawn(
            Arc::clone(&self.containers),
            Arc::clone(&self.events),
            self.reconcile_interval,
        )
    }

    pub fn reconcile_interval(&self) -> Duration {
        self.reconcile_interval
    }
}
