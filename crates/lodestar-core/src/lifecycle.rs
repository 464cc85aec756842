// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload lifecycle management.
//!
//! Each managed component converges towards "running at the current run
//! version". The state of a component is derived from what the container
//! runtime reports about the workload carrying the component's name:
//!
//! ```text
//!   StaleVersion ──remove──► Unprovisioned ──create──► ExitedCurrent
//!                                                          │
//!                                               join network, start
//!                                                          ▼
//!                                                   RunningCurrent ◄─┐
//!                                                          └─────────┘
//! ```
//!
//! Runtime failures end the convergence attempt of that one component and are
//! returned to the caller. Nothing is retried.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::container::{
    ContainerRuntime, LogSource, RuntimeError, WorkloadSpec, WorkloadStatus, WorkloadSummary,
};
use crate::registry::{ComponentState, Registry};

/// Label carrying the run version a workload was created for.
pub const RUN_VERSION_LABEL: &str = "lodestar.run_version";
/// Label carrying the component name.
pub const COMPONENT_LABEL: &str = "lodestar.component";
/// Label carrying the component's group, when it has one.
pub const GROUP_LABEL: &str = "lodestar.group";
/// Label carrying the component's external id, when it has one.
pub const EXTERNAL_ID_LABEL: &str = "lodestar.external_id";

/// Where a component stands relative to the current run version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No workload carries the component's name
    Unprovisioned,
    /// A workload exists but was created for another run version
    StaleVersion,
    /// A current workload exists but is not running
    ExitedCurrent,
    /// A current workload is running
    RunningCurrent,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::StaleVersion => "stale_version",
            Self::ExitedCurrent => "exited_current",
            Self::RunningCurrent => "running_current",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the lifecycle state from the runtime's view of a workload.
///
/// A current workload that is paused, dead, being removed or in an unknown
/// state cannot simply be started again and counts as stale.
pub fn resolve_state(existing: Option<&WorkloadSummary>, run_version: &str) -> LifecycleState {
    let Some(workload) = existing else {
        return LifecycleState::Unprovisioned;
    };

    if workload.label(RUN_VERSION_LABEL) != Some(run_version) {
        return LifecycleState::StaleVersion;
    }

    match workload.status {
        WorkloadStatus::Running | WorkloadStatus::Restarting => LifecycleState::RunningCurrent,
        WorkloadStatus::Created | WorkloadStatus::Exited => LifecycleState::ExitedCurrent,
        WorkloadStatus::Paused
        | WorkloadStatus::Dead
        | WorkloadStatus::Removing
        | WorkloadStatus::Unknown => LifecycleState::StaleVersion,
    }
}

/// Errors from converging a single component.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("component {0} has no workload image to provision")]
    Unmanaged(String),

    #[error("runtime error for component {component}: {source}")]
    Runtime {
        component: String,
        #[source]
        source: RuntimeError,
    },

    #[error("component {component} exited during startup (status: {status})")]
    ExitedDuringStartup {
        component: String,
        status: WorkloadStatus,
    },
}

impl LifecycleError {
    fn runtime(component: &str) -> impl Fn(RuntimeError) -> Self + '_ {
        move |source| Self::Runtime {
            component: component.to_string(),
            source,
        }
    }
}

/// Settings of the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Run version stamped on created workloads
    pub run_version: String,
    /// Shared network every workload joins
    pub network: String,
    /// How long a started workload must stay up to count as started; zero disables the check
    pub startup_grace: Duration,
    /// Forward workload output to the log after a start
    pub follow_logs: bool,
    /// Grace period for `stop_component`
    pub stop_timeout: Duration,
}

impl LifecycleConfig {
    pub fn new(run_version: impl Into<String>) -> Self {
        Self {
            run_version: run_version.into(),
            network: "lodestar-net".to_string(),
            startup_grace: Duration::from_secs(2),
            follow_logs: true,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a successful convergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergeOutcome {
    pub component: String,
    /// State the component was found in
    pub from: LifecycleState,
    /// Workload now backing the component
    pub workload_id: String,
}

/// Drives component workloads through the container runtime.
pub struct LifecycleManager {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    config: LifecycleConfig,
    network_id: OnceCell<String>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            config,
            network_id: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Id of the shared network, created on first use.
    pub async fn network_id(&self) -> Result<String, RuntimeError> {
        self.network_id
            .get_or_try_init(|| self.runtime.ensure_network(&self.config.network))
            .await
            .cloned()
    }

    /// Labels stamped on a component's workload.
    pub fn labels_for(&self, component: &ComponentState) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (RUN_VERSION_LABEL.to_string(), self.config.run_version.clone()),
            (COMPONENT_LABEL.to_string(), component.name().to_string()),
        ]);
        if !component.group().is_empty() {
            labels.insert(GROUP_LABEL.to_string(), component.group().to_string());
        }
        if !component.external_id().is_empty() {
            labels.insert(EXTERNAL_ID_LABEL.to_string(), component.external_id().to_string());
        }
        labels
    }

    /// Current lifecycle state of a component, without changing anything.
    pub async fn component_state(&self, name: &str) -> Result<LifecycleState, LifecycleError> {
        let existing = self
            .runtime
            .find_workload(name)
            .await
            .map_err(LifecycleError::runtime(name))?;
        Ok(resolve_state(existing.as_ref(), &self.config.run_version))
    }

    /// Converge one component to a running workload at the current run version.
    pub async fn start_component(&self, name: &str) -> Result<ConvergeOutcome, LifecycleError> {
        let component = self
            .registry
            .find(name)
            .await
            .ok_or_else(|| LifecycleError::UnknownComponent(name.to_string()))?;
        if !component.is_managed() {
            return Err(LifecycleError::Unmanaged(name.to_string()));
        }

        let _converging = component.begin_convergence().await;
        let runtime_err = LifecycleError::runtime(name);

        let existing = self.runtime.find_workload(name).await.map_err(&runtime_err)?;
        let from = resolve_state(existing.as_ref(), &self.config.run_version);
        debug!(component = %name, state = %from, "Resolved lifecycle state");

        let (workload_id, previous) = match (from, existing) {
            (LifecycleState::RunningCurrent, Some(workload)) => {
                component.set_workload_id(Some(workload.id.clone())).await;
                debug!(component = %name, workload_id = %workload.id, "Workload already running");
                return Ok(ConvergeOutcome {
                    component: name.to_string(),
                    from,
                    workload_id: workload.id,
                });
            }
            (LifecycleState::ExitedCurrent, Some(workload)) => (workload.id.clone(), Some(workload)),
            (LifecycleState::StaleVersion, Some(workload)) => {
                info!(
                    component = %name,
                    workload_id = %workload.id,
                    found_version = workload.label(RUN_VERSION_LABEL).unwrap_or("<none>"),
                    run_version = %self.config.run_version,
                    "Replacing stale workload"
                );
                self.runtime
                    .remove_workload(&workload.id, true)
                    .await
                    .map_err(&runtime_err)?;
                component.set_workload_id(None).await;
                (self.create_workload(&component).await?, None)
            }
            _ => (self.create_workload(&component).await?, None),
        };
        component.set_workload_id(Some(workload_id.clone())).await;

        let network_id = self.network_id().await.map_err(&runtime_err)?;
        if !previous
            .as_ref()
            .is_some_and(|w| w.is_attached_to(&network_id))
        {
            self.runtime
                .join_network(&workload_id, &network_id)
                .await
                .map_err(&runtime_err)?;
        }

        self.runtime
            .start_workload(&workload_id)
            .await
            .map_err(&runtime_err)?;
        self.await_startup(name, &workload_id).await?;

        if self.config.follow_logs {
            self.follow_logs(name, &workload_id);
        }

        info!(component = %name, workload_id = %workload_id, from = %from, "Component running");
        Ok(ConvergeOutcome {
            component: name.to_string(),
            from,
            workload_id,
        })
    }

    /// Stop a component's workload gracefully and keep it.
    ///
    /// Returns false when there was no running workload to stop.
    pub async fn stop_component(&self, name: &str) -> Result<bool, LifecycleError> {
        let component = self
            .registry
            .find(name)
            .await
            .ok_or_else(|| LifecycleError::UnknownComponent(name.to_string()))?;
        let _converging = component.begin_convergence().await;
        let runtime_err = LifecycleError::runtime(name);

        let Some(workload) = self.runtime.find_workload(name).await.map_err(&runtime_err)? else {
            return Ok(false);
        };
        if !workload.status.is_running() {
            return Ok(false);
        }

        self.runtime
            .stop_workload(&workload.id, self.config.stop_timeout)
            .await
            .map_err(&runtime_err)?;
        info!(component = %name, workload_id = %workload.id, "Stopped component");
        Ok(true)
    }

    /// Remove a component's workload, running or not, and forget its id.
    ///
    /// Returns false when the component had no workload.
    pub async fn kill_component(&self, name: &str) -> Result<bool, LifecycleError> {
        let component = self
            .registry
            .find(name)
            .await
            .ok_or_else(|| LifecycleError::UnknownComponent(name.to_string()))?;
        let _converging = component.begin_convergence().await;
        let runtime_err = LifecycleError::runtime(name);

        let existing = self.runtime.find_workload(name).await.map_err(&runtime_err)?;
        let removed = match existing {
            Some(workload) => {
                self.runtime
                    .remove_workload(&workload.id, true)
                    .await
                    .map_err(&runtime_err)?;
                info!(component = %name, workload_id = %workload.id, "Removed workload");
                true
            }
            None => false,
        };

        component.set_workload_id(None).await;
        Ok(removed)
    }

    /// Kill every registered component's workload, concurrently.
    pub async fn clean(&self) -> Vec<(String, Result<bool, LifecycleError>)> {
        let names = self.registry.names().await;
        let results = join_all(names.iter().map(|name| self.kill_component(name))).await;
        names.into_iter().zip(results).collect()
    }

    /// Launch convergence of every managed component and return immediately.
    ///
    /// Failures are logged per component. Returns the number of launched tasks.
    pub async fn start_all_components(self: &Arc<Self>) -> usize {
        let names = self.managed_names().await;
        let count = names.len();

        for name in names {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.start_component(&name).await {
                    error!(component = %name, error = %e, "Failed to converge component");
                }
            });
        }

        info!(components = count, "Launched component convergence");
        count
    }

    /// Like [`start_all_components`](Self::start_all_components), returning a
    /// handle per component for callers that need to await completion.
    pub async fn start_all_components_tracked(
        self: &Arc<Self>,
    ) -> Vec<(String, JoinHandle<Result<ConvergeOutcome, LifecycleError>>)> {
        let names = self.managed_names().await;

        names
            .into_iter()
            .map(|name| {
                let manager = self.clone();
                let task_name = name.clone();
                let handle = tokio::spawn(async move { manager.start_component(&task_name).await });
                (name, handle)
            })
            .collect()
    }

    async fn managed_names(&self) -> Vec<String> {
        self.registry
            .components()
            .await
            .into_iter()
            .filter(|c| c.is_managed())
            .map(|c| c.name().to_string())
            .collect()
    }

    async fn create_workload(&self, component: &ComponentState) -> Result<String, LifecycleError> {
        let spec = WorkloadSpec {
            name: component.name().to_string(),
            image: component.workload_ref().to_string(),
            labels: self.labels_for(component),
        };

        let id = self
            .runtime
            .create_workload(&spec)
            .await
            .map_err(LifecycleError::runtime(component.name()))?;

        info!(
            component = %component.name(),
            workload_id = %id,
            image = %spec.image,
            run_version = %self.config.run_version,
            "Created workload"
        );
        Ok(id)
    }

    /// Fail if the workload stops running within the startup grace period.
    async fn await_startup(&self, name: &str, workload_id: &str) -> Result<(), LifecycleError> {
        let grace = self.config.startup_grace;
        if grace.is_zero() {
            return Ok(());
        }

        match tokio::time::timeout(grace, self.runtime.wait_not_running(workload_id)).await {
            Err(_) => Ok(()),
            Ok(Ok(status)) => {
                warn!(component = %name, workload_id = %workload_id, status = %status, "Workload exited during startup");
                Err(LifecycleError::ExitedDuringStartup {
                    component: name.to_string(),
                    status,
                })
            }
            Ok(Err(e)) => Err(LifecycleError::Runtime {
                component: name.to_string(),
                source: e,
            }),
        }
    }

    fn follow_logs(&self, name: &str, workload_id: &str) {
        let runtime = self.runtime.clone();
        let component = name.to_string();
        let workload_id = workload_id.to_string();

        tokio::spawn(async move {
            let mut stream = match runtime.stream_logs(&workload_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(component = %component, error = %e, "Cannot follow workload logs");
                    return;
                }
            };

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(component = %component, error = %e, "Log stream failed");
                        break;
                    }
                };

                let text = String::from_utf8_lossy(&chunk.message);
                for line in text.lines().filter(|l| !l.is_empty()) {
                    match chunk.source {
                        LogSource::Stdout => info!(component = %component, "{}", line),
                        LogSource::Stderr => warn!(component = %component, stream = "stderr", "{}", line),
                    }
                }
            }

            debug!(component = %component, "Log stream ended");
        });
    }
}
