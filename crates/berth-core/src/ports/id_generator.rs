//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{ContainerId, DockerImageId, UploadedImageId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はエンティティの ID を生成
///
/// `Send + Sync` を要求（複数タスクから同時に使われる）
pub trait IdGenerator: Send + Sync {
    fn generate_container_id(&self) -> ContainerId;

    fn generate_docker_image_id(&self) -> DockerImageId;

    fn generate_uploaded_image_id(&self) -> UploadedImageId;
}

/// UlidGenerator は Clock の時刻で timestamp 部を作る
///
/// FixedClock を渡すと timestamp 部が決定的になります（ランダム部は毎回異なる）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_container_id(&self) -> ContainerId {
        ContainerId::from(self.next_ulid())
    }

    fn generate_docker_image_id(&self) -> DockerImageId {
        DockerImageId::from(self.next_ulid())
    }

    fn generate_uploaded_image_id(&self) -> UploadedImageId {
        UploadedImageId::from(self.next_ulid())
    }
}
