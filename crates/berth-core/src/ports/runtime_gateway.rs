//! RuntimeGateway port - コンテナエンジンへの唯一の境界
//!
//! RuntimeGateway は Docker daemon などの外部エンジンを操作する capability set です。
//! 自身は永続状態を持ちません。
//!
//! # 設計原則
//! - NotFound は「状態が乖離した（drift）」という意味であり、リクエスト全体の失敗ではない
//! - それ以外の失敗は Unavailable / Rejected / Timeout のいずれか
//! - すべての呼び出しは外部からタイムアウトを課される（`TimeoutGateway` を参照）

use std::time::Duration;

use async_trait::async_trait;

/// RuntimeError はエンジン呼び出しの失敗
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime object no longer exists.
    #[error("runtime object not found: {0}")]
    NotFound(String),

    /// The engine could not be reached or failed internally.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The engine refused the request.
    #[error("runtime rejected request: {0}")]
    Rejected(String),

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Engine-side container state as reported by inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl RuntimeState {
    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "created" => RuntimeState::Created,
            "running" => RuntimeState::Running,
            "paused" => RuntimeState::Paused,
            "restarting" => RuntimeState::Restarting,
            "removing" => RuntimeState::Removing,
            "exited" => RuntimeState::Exited,
            "dead" => RuntimeState::Dead,
            other => RuntimeState::Unknown(other.to_string()),
        }
    }
}

/// Parameters for `RuntimeGateway::run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub image: String,
    pub internal_port: u16,
    /// Fixed host port; `None` lets the engine pick one.
    pub host_port: Option<u16>,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
}

/// What `run` hands back once the engine accepted the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub runtime_id: String,
    pub exposed_port: Option<u16>,
}

/// RuntimeGateway はコンテナエンジンの capability set
///
/// `Send + Sync` を要求（Manager と reconcile loop から共有される）
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Create and start a container.
    async fn run(&self, spec: &RunSpec) -> Result<RunOutcome, RuntimeError>;

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError>;

    /// Start an existing container. Returns the host port it ended up bound to.
    async fn start(&self, runtime_id: &str) -> Result<Option<u16>, RuntimeError>;

    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError>;

    async fn exists(&self, runtime_id: &str) -> Result<bool, RuntimeError>;

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError>;

    /// `Ok(None)` when the container is gone.
    async fn status(&self, runtime_id: &str) -> Result<Option<RuntimeState>, RuntimeError>;

    async fn exposed_port(
        &self,
        runtime_id: &str,
        internal_port: u16,
    ) -> Result<Option<u16>, RuntimeError>;

    /// Load an image tarball. Returns the engine-assigned image id.
    async fn load_image(&self, path: &str) -> Result<String, RuntimeError>;

    async fn remove_image(&self, runtime_image_id: &str) -> Result<(), RuntimeError>;

    async fn image_exists(&self, runtime_image_id: &str) -> Result<bool, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::running("running", RuntimeState::Running)]
    #[case::exited("exited", RuntimeState::Exited)]
    #[case::paused("paused", RuntimeState::Paused)]
    #[case::unknown("weird", RuntimeState::Unknown("weird".into()))]
    fn parse_runtime_state(#[case] raw: &str, #[case] expected: RuntimeState) {
        assert_eq!(RuntimeState::parse(raw), expected);
    }

    #[test]
    fn only_running_counts_as_running() {
        assert!(RuntimeState::Running.is_running());
        assert!(!RuntimeState::Restarting.is_running());
        assert!(!RuntimeState::Exited.is_running());
    }
}
