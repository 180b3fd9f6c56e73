//! App - アプリケーション層
//!
//! ports を組み合わせてコントロールプレーンのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **ControlPlaneBuilder**: 構築とワイヤリング
//! - **ContainerManager**: コンテナのライフサイクルと reconcile の補正
//! - **ImageActivationManager**: (name, tag) ごとの active イメージ
//! - **ReconcileLoop**: バックグラウンドの定期 reconcile
//! - **KeyedLocks**: キー単位の排他

pub mod builder;
pub mod container_manager;
pub mod image_manager;
pub mod keyed_lock;
pub mod reconcile_loop;
pub mod retry;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ControlPlane, ControlPlaneBuilder};
pub use self::container_manager::{
    ContainerDefaults, ContainerManager, CreateContainer, ImageSource,
};
pub use self::image_manager::ImageActivationManager;
pub use self::keyed_lock::{KeyedGuard, KeyedLocks};
pub use self::reconcile_loop::{ReconcileHandle, ReconcileLoop};
pub use self::retry::RetryPolicy;
pub use self::status::{ContainerCounts, ReconcileReport};
