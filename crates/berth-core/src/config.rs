//! Config - TOML 設定
//!
//! すべての項目に既定値があり、ファイルが無い場合も既定値で起動します。
//!
//! ```toml
//! log_filter = "info,berth_core=debug"
//!
//! [runtime]
//! docker_socket = "/var/run/docker.sock"
//! connect_timeout_secs = 120
//! call_timeout_secs = 60
//!
//! [reconcile]
//! interval_secs = 10
//!
//! [defaults]
//! cpu_limit = 0.1
//! memory_limit_mb = 128
//! internal_port = 80
//! log_tail = 100
//!
//! [activation]
//! deactivate_attempts = 3
//! retry_base_delay_ms = 50
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::app::{ContainerDefaults, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BerthConfig {
    pub log_filter: String,
    pub runtime: RuntimeConfig,
    pub reconcile: ReconcileConfig,
    pub defaults: DefaultsConfig,
    pub activation: ActivationConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Unix socket of the Docker daemon. Unset means DOCKER_HOST or the platform default.
    pub docker_socket: Option<String>,
    pub connect_timeout_secs: u64,
    /// Upper bound for every single runtime call.
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub internal_port: u16,
    pub log_tail: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActivationConfig {
    pub deactivate_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
            runtime: RuntimeConfig::default(),
            reconcile: ReconcileConfig::default(),
            defaults: DefaultsConfig::default(),
            activation: ActivationConfig::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            connect_timeout_secs: 120,
            call_timeout_secs: 60,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        let defaults = ContainerDefaults::default();
        Self {
            cpu_limit: defaults.cpu_limit,
            memory_limit_mb: defaults.memory_limit_mb,
            internal_port: defaults.internal_port,
            log_tail: defaults.log_tail,
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            deactivate_attempts: 3,
            retry_base_delay_ms: 50,
        }
    }
}

impl BerthConfig {
    /// Read `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.interval_secs must be positive".into(),
            ));
        }
        if self.runtime.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "runtime.call_timeout_secs must be positive".into(),
            ));
        }
        if self.defaults.cpu_limit.is_nan() || self.defaults.cpu_limit <= 0.0 {
            return Err(ConfigError::Invalid(
                "defaults.cpu_limit must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn container_defaults(&self) -> ContainerDefaults {
        ContainerDefaults {
            cpu_limit: self.defaults.cpu_limit,
            memory_limit_mb: self.defaults.memory_limit_mb,
            internal_port: self.defaults.internal_port,
            log_tail: self.defaults.log_tail,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.activation.deactivate_attempts,
            Duration::from_millis(self.activation.retry_base_delay_ms),
        )
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.call_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = BerthConfig::from_toml_str("").unwrap();

        assert_eq!(config, BerthConfig::default());
        assert_eq!(config.reconcile_interval(), Duration::from_secs(10));
        assert_eq!(config.call_timeout(), Duration::from_secs(60));
        assert_eq!(config.container_defaults(), ContainerDefaults::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = BerthConfig::from_toml_str(
            r#"
            log_filter = "debug"

            [runtime]
            docker_socket = "/run/docker.sock"

            [defaults]
            memory_limit_mb = 256
            "#,
        )
        .unwrap();

        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.runtime.docker_socket.as_deref(), Some("/run/docker.sock"));
        assert_eq!(config.runtime.connect_timeout_secs, 120);
        assert_eq!(config.defaults.memory_limit_mb, 256);
        assert_eq!(config.defaults.internal_port, 80);
    }

    #[test]
    fn retry_policy_follows_activation_section() {
        let config = BerthConfig::from_toml_str(
            r#"
            [activation]
            deactivate_attempts = 5
            retry_base_delay_ms = 10
            "#,
        )
        .unwrap();

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = BerthConfig::from_toml_str("[reconcile]\nintervall_secs = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_interval_is_invalid() {
        let err = BerthConfig::from_toml_str("[reconcile]\ninterval_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = BerthConfig::load("/nonexistent/berth.toml").unwrap();
        assert_eq!(config, BerthConfig::default());
    }
}
