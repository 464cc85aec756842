// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for lodestar.
//!
//! This module provides [`OrchestratorRuntime`] which allows embedding the
//! orchestrator into an existing tokio application instead of running the
//! `lodestar` binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lodestar_core::container::DockerRuntime;
//! use lodestar_core::registry::Registry;
//! use lodestar_core::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(Registry::load("components.json")?);
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .registry(registry)
//!         .container_runtime(Arc::new(DockerRuntime::connect_local()?))
//!         .run_version("2024-06-01.1")
//!         .bind_addr("0.0.0.0:5000".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::comm::HandlerConfig;
use crate::config::Config;
use crate::container::ContainerRuntime;
use crate::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::matcher::{ConnectionMatcher, OrphanPolicy, run_listener};
use crate::registry::Registry;

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    registry: Option<Arc<Registry>>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    run_version: Option<String>,
    bind_addr: SocketAddr,
    network: String,
    self_name: Option<String>,
    handler_config: HandlerConfig,
    orphan_policy: OrphanPolicy,
    startup_grace: Duration,
    stop_timeout: Duration,
    follow_logs: bool,
    start_components: bool,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            container_runtime: None,
            run_version: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            network: "lodestar-net".to_string(),
            self_name: None,
            handler_config: HandlerConfig::default(),
            orphan_policy: OrphanPolicy::default(),
            startup_grace: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
            follow_logs: true,
            start_components: true,
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every setting that [`Config`] carries.
    pub fn with_config(self, config: &Config) -> Self {
        self.run_version(config.run_version.clone())
            .bind_addr(config.listen_addr)
            .network(config.network.clone())
            .self_name(config.self_name.clone())
            .handler_config(config.handler_config())
            .orphan_policy(config.orphan_policy)
            .startup_grace(config.startup_grace)
            .follow_logs(config.follow_logs)
    }

    /// Set the component registry (required).
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the container runtime (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the run version stamped on workloads (required).
    pub fn run_version(mut self, run_version: impl Into<String>) -> Self {
        self.run_version = Some(run_version.into());
        self
    }

    /// Set the listen address of the connection matcher.
    ///
    /// Default: `0.0.0.0:5000`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the shared network name.
    ///
    /// Default: `lodestar-net`
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Name of the orchestrator's own workload, joined to the shared network
    /// on start when the runtime knows it.
    ///
    /// Default: `None`
    pub fn self_name(mut self, name: impl Into<String>) -> Self {
        self.self_name = Some(name.into());
        self
    }

    pub fn handler_config(mut self, config: HandlerConfig) -> Self {
        self.handler_config = config;
        self
    }

    /// Default: [`OrphanPolicy::Reject`]
    pub fn orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    /// Default: 2 seconds
    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Default: 10 seconds
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Default: true
    pub fn follow_logs(mut self, follow: bool) -> Self {
        self.follow_logs = follow;
        self
    }

    /// Launch convergence of every component on start.
    ///
    /// Default: true
    pub fn start_components(mut self, start: bool) -> Self {
        self.start_components = start;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| anyhow::anyhow!("container_runtime is required"))?;
        let run_version = self
            .run_version
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("run_version is required"))?;

        Ok(OrchestratorRuntimeConfig {
            registry,
            container_runtime,
            lifecycle: LifecycleConfig {
                run_version,
                network: self.network,
                startup_grace: self.startup_grace,
                follow_logs: self.follow_logs,
                stop_timeout: self.stop_timeout,
            },
            bind_addr: self.bind_addr,
            self_name: self.self_name,
            handler_config: self.handler_config,
            orphan_policy: self.orphan_policy,
            start_components: self.start_components,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    registry: Arc<Registry>,
    container_runtime: Arc<dyn ContainerRuntime>,
    lifecycle: LifecycleConfig,
    bind_addr: SocketAddr,
    self_name: Option<String>,
    handler_config: HandlerConfig,
    orphan_policy: OrphanPolicy,
    start_components: bool,
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime: prepare the network, spawn the connection matcher
    /// and launch component convergence.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let lifecycle = Arc::new(LifecycleManager::new(
            self.registry.clone(),
            self.container_runtime.clone(),
            self.lifecycle,
        ));

        let network_id = lifecycle
            .network_id()
            .await
            .with_context(|| format!("failed to prepare network {}", lifecycle.config().network))?;

        if let Some(self_name) = &self.self_name {
            join_own_workload(self.container_runtime.as_ref(), self_name, &network_id).await;
        }

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.bind_addr))?;
        let local_addr = listener.local_addr()?;

        let matcher = Arc::new(
            ConnectionMatcher::new(
                self.registry.clone(),
                self.container_runtime.clone(),
                self.handler_config,
            )
            .with_orphan_policy(self.orphan_policy),
        );

        let (listener_shutdown_tx, listener_shutdown_rx) = watch::channel(false);
        let listener_handle = tokio::spawn(run_listener(listener, matcher, listener_shutdown_rx));

        let launched = if self.start_components {
            lifecycle.start_all_components().await
        } else {
            0
        };

        info!(
            local_addr = %local_addr,
            network_id = %network_id,
            runtime = self.container_runtime.runtime_type(),
            run_version = %lifecycle.config().run_version,
            launched,
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            listener_handle,
            listener_shutdown_tx,
            lifecycle,
            registry: self.registry,
            local_addr,
        })
    }
}

/// Join the orchestrator's own workload to the shared network so workloads can
/// reach the listener. Failures are logged, not fatal.
async fn join_own_workload(runtime: &dyn ContainerRuntime, self_name: &str, network_id: &str) {
    match runtime.find_workload(self_name).await {
        Ok(Some(own)) if own.is_attached_to(network_id) => {
            debug!(workload = %self_name, "Own workload already on the shared network");
        }
        Ok(Some(own)) => match runtime.join_network(&own.id, network_id).await {
            Ok(()) => info!(workload = %self_name, network_id = %network_id, "Joined own workload to the shared network"),
            Err(e) => warn!(workload = %self_name, error = %e, "Failed to join own workload to the shared network"),
        },
        Ok(None) => {
            debug!(workload = %self_name, "Not running inside a managed workload");
        }
        Err(e) => {
            warn!(workload = %self_name, error = %e, "Failed to look up own workload");
        }
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// The runtime manages:
/// - the connection matcher's accept loop
/// - a communication handler per connected component
/// - fire-and-forget convergence of every component launched on start
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    listener_handle: JoinHandle<Result<()>>,
    listener_shutdown_tx: watch::Sender<bool>,
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Address the connection matcher is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Check if the accept loop is still running.
    pub fn is_running(&self) -> bool {
        !self.listener_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting connections, then shuts down every communication
    /// handler. Workloads are left running.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        let _ = self.listener_shutdown_tx.send(true);

        let result = match self.listener_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Connection matcher error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Connection matcher task panicked: {}", e);
                Err(anyhow::anyhow!("listener task panicked: {}", e))
            }
        };

        let handlers = self.registry.shutdown_handlers().await;
        info!(handlers, "OrchestratorRuntime shutdown complete");
        result
    }
}
