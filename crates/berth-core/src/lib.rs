//! berth-core
//!
//! Single-host container control plane.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, container, image, errors, events）
//! - **ports**: 抽象化レイヤー（RuntimeGateway, 各 Repository, Clock, IdGenerator, EventSink）
//! - **impls**: 実装（DockerGateway, TimeoutGateway, InMemory 系）
//! - **app**: アプリケーションロジック（builder, container_manager, image_manager, reconcile_loop）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
