//! Container record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ContainerId, DockerImageId};

/// Container status as persisted.
///
/// State transitions:
/// - Pending -> Running | Failed (after the run attempt)
/// - Running <-> Stopped (explicit stop/start, or reconciliation)
/// - Running -> Failed (reconciliation: runtime object vanished)
///
/// `Failed` is terminal for automatic recovery; the caller has to recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

impl ContainerStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Pending => "pending",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a container runs from.
///
/// Either a free-form runtime reference ("nginx:latest") or a managed
/// DockerImage row, in which case the runtime image id it resolved to at
/// creation time is kept alongside the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerImage {
    Reference { reference: String },
    Managed {
        image_id: DockerImageId,
        runtime_image_id: String,
    },
}

impl ContainerImage {
    /// The string handed to the runtime's `run`.
    pub fn runtime_ref(&self) -> &str {
        match self {
            ContainerImage::Reference { reference } => reference,
            ContainerImage::Managed {
                runtime_image_id, ..
            } => runtime_image_id,
        }
    }

    pub fn docker_image_id(&self) -> Option<DockerImageId> {
        match self {
            ContainerImage::Reference { .. } => None,
            ContainerImage::Managed { image_id, .. } => Some(*image_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU share in cores (0.5 = half a core).
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
}

/// Persisted container record.
///
/// Invariant: `exposed_port` is `None` unless `status == Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub image: ContainerImage,
    pub status: ContainerStatus,
    pub limits: ResourceLimits,
    pub internal_port: u16,
    pub exposed_port: Option<u16>,
    pub runtime_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Container {
    pub fn new_pending(
        id: ContainerId,
        image: ContainerImage,
        limits: ResourceLimits,
        internal_port: u16,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            image,
            status: ContainerStatus::Pending,
            limits,
            internal_port,
            exposed_port: None,
            runtime_id: None,
            created_at,
        }
    }

    /// Apply a partial update in place, the same way a repository would.
    pub fn apply(&mut self, update: &ContainerUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(runtime_id) = &update.runtime_id {
            self.runtime_id = runtime_id.clone();
        }
        if let Some(exposed_port) = update.exposed_port {
            self.exposed_port = exposed_port;
        }
    }
}

/// Partial update for a container record.
///
/// `runtime_id` / `exposed_port` are tri-state:
/// `None` leaves the field alone, `Some(None)` clears it, `Some(Some(v))` sets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerUpdate {
    pub status: Option<ContainerStatus>,
    pub runtime_id: Option<Option<String>>,
    pub exposed_port: Option<Option<u16>>,
}

impl ContainerUpdate {
    pub fn status(status: ContainerStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn running(runtime_id: String, exposed_port: Option<u16>) -> Self {
        Self {
            status: Some(ContainerStatus::Running),
            runtime_id: Some(Some(runtime_id)),
            exposed_port: Some(exposed_port),
        }
    }

    /// Stopped, runtime binding kept so the container can be started again.
    pub fn stopped() -> Self {
        Self {
            status: Some(ContainerStatus::Stopped),
            runtime_id: None,
            exposed_port: Some(None),
        }
    }

    /// Stopped with the runtime binding dropped (runtime object is gone).
    pub fn stopped_unbound() -> Self {
        Self {
            status: Some(ContainerStatus::Stopped),
            runtime_id: Some(None),
            exposed_port: Some(None),
        }
    }

    pub fn failed_unbound() -> Self {
        Self {
            status: Some(ContainerStatus::Failed),
            runtime_id: Some(None),
            exposed_port: Some(None),
        }
    }

    pub fn exposed_port(port: Option<u16>) -> Self {
        Self {
            exposed_port: Some(port),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.runtime_id.is_none() && self.exposed_port.is_none()
    }
}
