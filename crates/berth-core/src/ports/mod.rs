//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（コンテナエンジン、永続層）へのインターフェースで、
//! 実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - 永続層が source of truth（正本）
//! - コンテナエンジンへの呼び出しはすべて RuntimeGateway を通す

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod repository;
pub mod runtime_gateway;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::repository::{
    ContainerRepository, DockerImageRepository, RepositoryError, UploadedImageRepository,
};
pub use self::runtime_gateway::{RunOutcome, RunSpec, RuntimeError, RuntimeGateway, RuntimeState};
