// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lodestar - Component Orchestrator
//!
//! Responsible for:
//! - Loading the component tree and building the registry
//! - Converging every component to a workload at the current run version
//! - Matching workload connections to components and pumping their traffic

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use lodestar_core::config::Config;
use lodestar_core::container::{ContainerRuntime, DockerRuntime};
use lodestar_core::registry::Registry;
use lodestar_core::runtime::OrchestratorRuntime;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lodestar_core=info,lodestar_protocol=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal_at_startup() => {
            error!(error = %e, "Invalid configuration, refusing to start");
            ExitCode::from(e.exit_code())
        }
        Err(e) => {
            error!(error = %e, "Lodestar failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> lodestar_core::Result<()> {
    let config = Config::from_env()?;

    info!(
        run_version = %config.run_version,
        listen_addr = %config.listen_addr,
        component_tree = %config.component_tree.display(),
        "Starting Lodestar"
    );

    let registry = Arc::new(Registry::load(&config.component_tree)?);
    info!(components = registry.len().await, "Component registry ready");

    let runtime = Arc::new(DockerRuntime::connect_local()?);
    info!(runtime_type = runtime.runtime_type(), "Container runtime initialized");

    let orchestrator = OrchestratorRuntime::builder()
        .with_config(&config)
        .registry(registry)
        .container_runtime(runtime)
        .build()?
        .start()
        .await?;

    info!(addr = %orchestrator.local_addr(), "Lodestar ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    orchestrator.shutdown().await?;

    info!("Lodestar shut down");

    Ok(())
}
