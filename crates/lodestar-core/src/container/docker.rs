// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker Engine backend for the container runtime capability.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{ContainerSummary, EndpointSettings};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::traits::*;

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(map_docker_error)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn list_filtered(&self, key: &str, value: &str) -> Result<Vec<WorkloadSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(key.to_string(), vec![value.to_string()])]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_docker_error)?;
        Ok(containers.into_iter().filter_map(summary_from).collect())
    }

    async fn status_of(&self, id: &str) -> Result<WorkloadStatus> {
        self.list_filtered("id", id)
            .await?
            .into_iter()
            .find(|w| w.id == id || w.id.starts_with(id))
            .map(|w| w.status)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_docker_error)?;
        Ok(containers.into_iter().filter_map(summary_from).collect())
    }

    async fn find_workload(&self, name: &str) -> Result<Option<WorkloadSummary>> {
        // The daemon's name filter matches substrings; keep only the exact name.
        Ok(self
            .list_filtered("name", name)
            .await?
            .into_iter()
            .find(|w| w.name == name))
    }

    async fn workload_by_address(&self, ip: IpAddr) -> Result<Option<WorkloadSummary>> {
        Ok(self
            .list_workloads()
            .await?
            .into_iter()
            .find(|w| w.has_address(ip)))
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_docker_error)?;

        for warning in &response.warnings {
            warn!(workload = %spec.name, warning = %warning, "Docker warning on create");
        }

        info!(workload = %spec.name, workload_id = %response.id, image = %spec.image, "Created workload");
        Ok(response.id)
    }

    async fn start_workload(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)
    }

    async fn wait_not_running(&self, id: &str) -> Result<WorkloadStatus> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.docker.wait_container(id, Some(options)));

        match stream.next().await {
            Some(Ok(response)) => {
                debug!(workload_id = %id, status_code = response.status_code, "Workload stopped running");
            }
            Some(Err(e)) => {
                // A non-zero exit code surfaces as an error here; the status
                // lookup below decides whether the workload really stopped.
                debug!(workload_id = %id, error = %e, "Wait returned an error");
            }
            None => {}
        }

        let status = self.status_of(id).await?;
        if status.is_running() {
            return Err(RuntimeError::InvalidResponse(format!(
                "wait for {} returned while it is still {}",
                id, status
            )));
        }
        Ok(status)
    }

    async fn stop_workload(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn remove_workload(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_docker_error)
    }

    async fn join_network(&self, id: &str, network_id: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: id.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.docker
            .connect_network(network_id, options)
            .await
            .map_err(map_docker_error)
    }

    async fn ensure_network(&self, name: &str) -> Result<String> {
        let options = ListNetworksOptions::<String> {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };
        let existing = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(map_docker_error)?;

        if let Some(id) = existing
            .into_iter()
            .find(|n| n.name.as_deref() == Some(name))
            .and_then(|n| n.id)
        {
            debug!(network = %name, network_id = %id, "Using existing network");
            return Ok(id);
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(map_docker_error)?;

        let id = response.id.ok_or_else(|| {
            RuntimeError::InvalidResponse(format!("network {} created without an id", name))
        })?;
        info!(network = %name, network_id = %id, "Created network");
        Ok(id)
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(LogChunk {
                            source: LogSource::Stdout,
                            message,
                        }))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk {
                        source: LogSource::Stderr,
                        message,
                    })),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(map_docker_error(e))),
                }
            });

        Ok(Box::pin(stream))
    }
}

fn summary_from(container: ContainerSummary) -> Option<WorkloadSummary> {
    let id = container.id?;
    let name = container
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let status = container
        .state
        .as_deref()
        .map(WorkloadStatus::from)
        .unwrap_or(WorkloadStatus::Unknown);

    let networks = container
        .network_settings
        .and_then(|settings| settings.networks)
        .map(|networks| {
            networks
                .into_iter()
                .map(|(network_name, endpoint)| NetworkAttachment {
                    network_id: endpoint.network_id.unwrap_or_default(),
                    network_name,
                    ip_address: endpoint
                        .ip_address
                        .filter(|ip| !ip.is_empty())
                        .and_then(|ip| ip.parse().ok()),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(WorkloadSummary {
        id,
        name,
        labels: container.labels.unwrap_or_default(),
        status,
        networks,
    })
}

fn map_docker_error(e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        bollard::errors::Error::IOError { err } => RuntimeError::Io(err),
        other => RuntimeError::Api(other.to_string()),
    }
}
