//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **DockerGateway**: bollard 経由の本番用 RuntimeGateway
//! - **TimeoutGateway**: 任意の RuntimeGateway に呼び出し単位のタイムアウトを課す
//! - **InMemoryRuntime**: Docker なしで動く開発・テスト用エンジン
//! - **InMemory*Repository**: 開発・テスト用の永続層
//! - **InMemoryEventLog**: 診断イベントの追記ログ

pub mod docker_runtime;
pub mod event_log;
pub mod inmem_repository;
pub mod inmem_runtime;
pub mod timeout;

// 主要な型を再エクスポート
pub use self::docker_runtime::DockerGateway;
pub use self::event_log::InMemoryEventLog;
pub use self::inmem_repository::{
    InMemoryContainerRepository, InMemoryDockerImageRepository, InMemoryUploadedImageRepository,
};
pub use self::inmem_runtime::InMemoryRuntime;
pub use self::timeout::TimeoutGateway;
