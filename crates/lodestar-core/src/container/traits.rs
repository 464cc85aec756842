// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait definitions.
//!
//! Defines the abstract interface the orchestrator uses to manage workloads.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Workload or network was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A workload or network with that name already exists, or the
    /// operation conflicts with the workload's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Container runtime API call failed.
    #[error("Runtime API error: {0}")]
    Api(String),

    /// Runtime returned a response the orchestrator cannot use.
    #[error("Unexpected runtime response: {0}")]
    InvalidResponse(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Runtime-reported state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl WorkloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the workload's process is (about to be) up.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

impl From<&str> for WorkloadStatus {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload's membership in a virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network_id: String,
    pub network_name: String,
    /// Address of the workload on that network, once assigned
    pub ip_address: Option<IpAddr>,
}

/// What the runtime reports about one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    /// Runtime-assigned identifier
    pub id: String,
    /// Workload name (equals the component name for managed workloads)
    pub name: String,
    pub labels: HashMap<String, String>,
    pub status: WorkloadStatus,
    pub networks: Vec<NetworkAttachment>,
}

impl WorkloadSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn has_address(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|n| n.ip_address == Some(ip))
    }

    pub fn is_attached_to(&self, network_id: &str) -> bool {
        self.networks
            .iter()
            .any(|n| n.network_id == network_id || n.network_name == network_id)
    }
}

/// Everything needed to create a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    /// Image reference to run
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Which output stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// A piece of workload output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub source: LogSource,
    pub message: Bytes,
}

/// Stream of workload output, ending when the workload's output closes.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogChunk>> + Send>>;

/// Trait for container runtimes.
///
/// Implementations talk to whatever actually runs the workloads (Docker, an
/// in-memory double, ...). They hold no orchestration state; deciding what to
/// create, start or remove is the lifecycle manager's job.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// List every workload the runtime knows about, running or not.
    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>>;

    /// Find the workload with exactly this name.
    async fn find_workload(&self, name: &str) -> Result<Option<WorkloadSummary>> {
        Ok(self
            .list_workloads()
            .await?
            .into_iter()
            .find(|w| w.name == name))
    }

    /// Find the workload holding this address on any of its networks.
    async fn workload_by_address(&self, ip: IpAddr) -> Result<Option<WorkloadSummary>> {
        Ok(self
            .list_workloads()
            .await?
            .into_iter()
            .find(|w| w.has_address(ip)))
    }

    /// Create (but do not start) a workload. Returns its identifier.
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String>;

    async fn start_workload(&self, id: &str) -> Result<()>;

    /// Wait until the workload is no longer running and return its final status.
    ///
    /// Does not time out on its own; callers bound it.
    async fn wait_not_running(&self, id: &str) -> Result<WorkloadStatus>;

    /// Stop the workload gracefully, killing it after `timeout`.
    async fn stop_workload(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Remove the workload. `force` removes it even while running.
    async fn remove_workload(&self, id: &str, force: bool) -> Result<()>;

    async fn join_network(&self, id: &str, network_id: &str) -> Result<()>;

    /// Return the id of the named network, creating it when absent.
    async fn ensure_network(&self, name: &str) -> Result<String>;

    /// Follow the workload's output.
    async fn stream_logs(&self, id: &str) -> Result<LogStream>;
}
