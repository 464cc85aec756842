// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lodestar_protocol::DEFAULT_MAX_PAYLOAD_SIZE;

use crate::comm::HandlerConfig;
use crate::matcher::OrphanPolicy;

/// Lodestar orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Runtime version tag stamped on every workload created by this run
    pub run_version: String,
    /// Path of the component tree JSON file
    pub component_tree: PathBuf,
    /// TCP address the connection matcher listens on
    pub listen_addr: SocketAddr,
    /// Shared virtual network every workload joins
    pub network: String,
    /// Name of the orchestrator's own workload, joined to the network when present
    pub self_name: String,
    /// Ceiling on accepted frame payloads
    pub max_payload: usize,
    /// Capacity of each communication handler queue
    pub channel_capacity: usize,
    /// How long to watch a freshly started workload for an early exit
    pub startup_grace: Duration,
    /// What to do with connections from peers that are not known workloads
    pub orphan_policy: OrphanPolicy,
    /// Echo workload traffic back to the workload
    pub echo_to_workload: bool,
    /// Stream workload logs into the orchestrator log
    pub follow_logs: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `LODESTAR_RUN_VERSION` (or `RUNTIME_HASH`): run version tag
    /// - `LODESTAR_COMPONENT_TREE`: component tree file
    ///
    /// Optional (with defaults):
    /// - `LODESTAR_PORT`: matcher port (default: 5000)
    /// - `LODESTAR_NETWORK`: network name (default: lodestar-net)
    /// - `LODESTAR_SELF_NAME`: own workload name (default: lodestar)
    /// - `LODESTAR_MAX_PAYLOAD_BYTES`: payload ceiling (default: 1 GiB)
    /// - `LODESTAR_CHANNEL_CAPACITY`: handler queue capacity (default: 256)
    /// - `LODESTAR_STARTUP_GRACE_MS`: startup watch window, 0 disables (default: 2000)
    /// - `LODESTAR_ORPHAN_POLICY`: `reject` or `register` (default: reject)
    /// - `LODESTAR_ECHO`: echo workload traffic (default: false)
    /// - `LODESTAR_FOLLOW_LOGS`: follow workload logs (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_version = std::env::var("LODESTAR_RUN_VERSION")
            .or_else(|_| std::env::var("RUNTIME_HASH"))
            .map_err(|_| ConfigError::Missing("LODESTAR_RUN_VERSION"))?;
        if run_version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "LODESTAR_RUN_VERSION",
                "must not be empty",
            ));
        }

        let component_tree = std::env::var("LODESTAR_COMPONENT_TREE")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("LODESTAR_COMPONENT_TREE"))?;

        let port: u16 = parse_var("LODESTAR_PORT", 5000, "must be a valid port number")?;

        let network =
            std::env::var("LODESTAR_NETWORK").unwrap_or_else(|_| "lodestar-net".to_string());
        let self_name = std::env::var("LODESTAR_SELF_NAME").unwrap_or_else(|_| "lodestar".to_string());

        let max_payload: usize = parse_var(
            "LODESTAR_MAX_PAYLOAD_BYTES",
            DEFAULT_MAX_PAYLOAD_SIZE,
            "must be a byte count",
        )?;
        if max_payload > u32::MAX as usize {
            return Err(ConfigError::Invalid(
                "LODESTAR_MAX_PAYLOAD_BYTES",
                "must fit in a 4-byte length header",
            ));
        }

        let channel_capacity: usize =
            parse_var("LODESTAR_CHANNEL_CAPACITY", 256, "must be a positive integer")?;
        if channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "LODESTAR_CHANNEL_CAPACITY",
                "must be a positive integer",
            ));
        }

        let startup_grace_ms: u64 =
            parse_var("LODESTAR_STARTUP_GRACE_MS", 2000, "must be milliseconds")?;

        let orphan_policy = match std::env::var("LODESTAR_ORPHAN_POLICY") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid("LODESTAR_ORPHAN_POLICY", "must be 'reject' or 'register'")
            })?,
            Err(_) => OrphanPolicy::default(),
        };

        let echo_to_workload = parse_flag("LODESTAR_ECHO", false)?;
        let follow_logs = parse_flag("LODESTAR_FOLLOW_LOGS", true)?;

        Ok(Self {
            run_version,
            component_tree,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            network,
            self_name,
            max_payload,
            channel_capacity,
            startup_grace: Duration::from_millis(startup_grace_ms),
            orphan_policy,
            echo_to_workload,
            follow_logs,
        })
    }

    /// Settings applied to every communication handler
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            channel_capacity: self.channel_capacity,
            max_payload: self.max_payload,
            echo_to_workload: self.echo_to_workload,
        }
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

fn parse_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid(name, "must be true or false")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
