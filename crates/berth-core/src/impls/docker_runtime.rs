//! DockerGateway - bollard による RuntimeGateway の本番実装
//!
//! # エラーの対応
//! - HTTP 404 → `RuntimeError::NotFound`
//! - その他の 4xx → `RuntimeError::Rejected`
//! - 接続エラーや 5xx → `RuntimeError::Unavailable`
//! - start/stop の 304（既にその状態）は成功扱い

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ImportImageOptions, RemoveImageOptions};
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use crate::ports::{RunOutcome, RunSpec, RuntimeError, RuntimeGateway, RuntimeState};

/// Docker rejects memory limits below 6 MB.
const MIN_MEMORY_MB: u64 = 6;

/// Seconds the engine waits for a graceful stop before killing.
const STOP_GRACE_SECS: i64 = 10;

fn map_error(e: bollard::errors::Error, object: &str) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(object.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } if (400..500).contains(&status_code) => {
            RuntimeError::Rejected(format!("{object}: HTTP {status_code} - {message}"))
        }
        other => RuntimeError::Unavailable(format!("{object}: {other}")),
    }
}

fn is_not_modified(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn port_key(internal_port: u16) -> String {
    format!("{internal_port}/tcp")
}

/// First host port bound to `internal_port`, if any.
fn bound_port(inspect: &ContainerInspectResponse, internal_port: Option<u16>) -> Option<u16> {
    let ports = inspect.network_settings.as_ref()?.ports.as_ref()?;
    let bindings: Vec<&PortBinding> = match internal_port {
        Some(port) => ports.get(&port_key(port))?.iter().flatten().collect(),
        None => ports.values().flatten().flatten().collect(),
    };
    bindings
        .into_iter()
        .filter_map(|b| b.host_port.as_deref())
        .find_map(|p| p.parse().ok())
}

/// `Loaded image ID: sha256:...` / `Loaded image: name:tag`
fn parse_load_output(line: &str) -> Option<LoadedImage> {
    let line = line.trim();
    if let Some(id) = line.strip_prefix("Loaded image ID:") {
        return Some(LoadedImage::Id(id.trim().to_string()));
    }
    line.strip_prefix("Loaded image:")
        .map(|reference| LoadedImage::Reference(reference.trim().to_string()))
}

#[derive(Debug, PartialEq, Eq)]
enum LoadedImage {
    Id(String),
    Reference(String),
}

#[derive(Clone)]
pub struct DockerGateway {
    client: Docker,
}

impl DockerGateway {
    pub fn new(client: Docker) -> Self {
        Self { client }
    }

    /// Connect to the daemon socket and ping it.
    ///
    /// `socket` of `None` uses the platform defaults (DOCKER_HOST or the local socket).
    pub async fn connect(socket: Option<&str>, timeout_secs: u64) -> Result<Self, RuntimeError> {
        let client = match socket {
            Some(path) => {
                Docker::connect_with_unix(path, timeout_secs, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Unavailable(format!("connect: {e}")))?;

        client
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("ping: {e}")))?;
        info!("connected to docker daemon");

        Ok(Self { client })
    }

    async fn inspect(&self, runtime_id: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        self.client
            .inspect_container(runtime_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(e, runtime_id))
    }

    async fn pull_if_missing(&self, image: &str) -> Result<(), RuntimeError> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_error(e, image)),
        }

        info!(image, "pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| map_error(e, image))?;
            if let Some(status) = info.status {
                debug!(image, status = %status, "pull progress");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeGateway for DockerGateway {
    async fn run(&self, spec: &RunSpec) -> Result<RunOutcome, RuntimeError> {
        self.pull_if_missing(&spec.image).await?;

        let key = port_key(spec.internal_port);
        let binding = PortBinding {
            host_ip: None,
            // empty host port lets the engine pick one
            host_port: Some(spec.host_port.map(|p| p.to_string()).unwrap_or_default()),
        };
        let memory_bytes = spec.memory_limit_mb.max(MIN_MEMORY_MB) as i64 * 1024 * 1024;
        let host_config = HostConfig {
            memory: Some(memory_bytes),
            nano_cpus: Some((spec.cpu_limit * 1_000_000_000.0) as i64),
            port_bindings: Some(HashMap::from([(key.clone(), Some(vec![binding]))])),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            exposed_ports: Some(HashMap::from([(key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| map_error(e, &spec.image))?;
        for warning in &created.warnings {
            warn!(runtime_id = %created.id, warning = %warning, "docker create warning");
        }

        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Leave no half-created container behind.
            let _ = self.remove(&created.id).await;
            return Err(map_error(e, &created.id));
        }

        let inspect = self.inspect(&created.id).await?;
        let exposed_port = bound_port(&inspect, Some(spec.internal_port));
        info!(runtime_id = %created.id, image = %spec.image, ?exposed_port, "container started");

        Ok(RunOutcome {
            runtime_id: created.id,
            exposed_port,
        })
    }

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .stop_container(runtime_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_error(e, runtime_id)),
        }
    }

    async fn start(&self, runtime_id: &str) -> Result<Option<u16>, RuntimeError> {
        match self
            .client
            .start_container(runtime_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_modified(&e) => {}
            Err(e) => return Err(map_error(e, runtime_id)),
        }
        let inspect = self.inspect(runtime_id).await?;
        Ok(bound_port(&inspect, None))
    }

    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.client
            .remove_container(
                runtime_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error(e, runtime_id))
    }

    async fn exists(&self, runtime_id: &str) -> Result<bool, RuntimeError> {
        match self.inspect(runtime_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.logs(runtime_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let message = match chunk.map_err(|e| map_error(e, runtime_id))? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => message,
            };
            out.push_str(&String::from_utf8_lossy(&message));
        }
        Ok(out)
    }

    async fn status(&self, runtime_id: &str) -> Result<Option<RuntimeState>, RuntimeError> {
        let inspect = match self.inspect(runtime_id).await {
            Ok(inspect) => inspect,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let state = inspect
            .state
            .and_then(|s| s.status)
            .map(|s| RuntimeState::parse(&s.to_string()))
            .unwrap_or_else(|| RuntimeState::Unknown(String::new()));
        Ok(Some(state))
    }

    async fn exposed_port(
        &self,
        runtime_id: &str,
        internal_port: u16,
    ) -> Result<Option<u16>, RuntimeError> {
        let inspect = self.inspect(runtime_id).await?;
        Ok(bound_port(&inspect, Some(internal_port)))
    }

    async fn load_image(&self, path: &str) -> Result<String, RuntimeError> {
        let tarball = tokio::fs::read(path)
            .await
            .map_err(|e| RuntimeError::Rejected(format!("read {path}: {e}")))?;

        let mut stream = self.client.import_image(
            ImportImageOptions { quiet: true },
            bytes::Bytes::from(tarball),
            None,
        );
        let mut loaded = None;
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| map_error(e, path))?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Rejected(format!("load {path}: {error}")));
            }
            if let Some(found) = info.stream.as_deref().and_then(parse_load_output) {
                loaded.get_or_insert(found);
            }
        }

        match loaded {
            Some(LoadedImage::Id(id)) => Ok(id),
            Some(LoadedImage::Reference(reference)) => {
                let image = self
                    .client
                    .inspect_image(&reference)
                    .await
                    .map_err(|e| map_error(e, &reference))?;
                image
                    .id
                    .ok_or_else(|| RuntimeError::Rejected(format!("{reference}: engine returned no id")))
            }
            None => Err(RuntimeError::Rejected(format!(
                "load {path}: engine reported no loaded image"
            ))),
        }
    }

    async fn remove_image(&self, runtime_image_id: &str) -> Result<(), RuntimeError> {
        self.client
            .remove_image(runtime_image_id, None::<RemoveImageOptions>, None)
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, runtime_image_id))
    }

    async fn image_exists(&self, runtime_image_id: &str) -> Result<bool, RuntimeError> {
        match self.client.inspect_image(runtime_image_id).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(e, runtime_image_id)),
        }
    }
}
