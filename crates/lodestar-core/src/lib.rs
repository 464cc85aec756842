// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lodestar Core - Component Orchestration
//!
//! This crate is the control plane and data plane of lodestar. It keeps every
//! component of a tree converged to a running workload at the current run
//! version, and keeps a framed TCP channel open between itself and each
//! workload.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      lodestar-core (This Crate)                      │
//! │                                                                      │
//! │  component tree ──► Registry ◄──────────── ConnectionMatcher         │
//! │                        │  name → ComponentState     ▲  port 5000     │
//! │                        │     ├ workload id          │                │
//! │                        │     └ CommHandler ◄────────┤                │
//! │                        ▼                            │                │
//! │                 LifecycleManager                    │                │
//! └────────────────────────┬────────────────────────────┼────────────────┘
//!                          │ create / start / remove    │ framed TCP
//!                          ▼                            │
//!               ┌──────────────────────┐     ┌──────────┴──────────┐
//!               │  Container runtime   │────►│     Workloads       │
//!               │  (Docker, mock)      │     │ (lodestar-protocol) │
//!               └──────────────────────┘     └─────────────────────┘
//! ```
//!
//! # Component Lifecycle
//!
//! ```text
//!   StaleVersion ──remove──► Unprovisioned ──create──► ExitedCurrent
//!                                                          │ join network, start
//!                                                          ▼
//!                                                   RunningCurrent
//! ```
//!
//! A workload is current when its `lodestar.run_version` label equals the run
//! version of this process.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `LODESTAR_RUN_VERSION` | Yes* | - | Run version stamped on workloads |
//! | `RUNTIME_HASH` | Yes* | - | Fallback if above not set |
//! | `LODESTAR_COMPONENT_TREE` | Yes | - | Component tree JSON file |
//! | `LODESTAR_PORT` | No | `5000` | Connection matcher port |
//! | `LODESTAR_NETWORK` | No | `lodestar-net` | Shared network |
//! | `LODESTAR_SELF_NAME` | No | `lodestar` | Orchestrator's own workload |
//! | `LODESTAR_MAX_PAYLOAD_BYTES` | No | `1073741824` | Frame payload ceiling |
//! | `LODESTAR_CHANNEL_CAPACITY` | No | `256` | Handler queue capacity |
//! | `LODESTAR_STARTUP_GRACE_MS` | No | `2000` | Post-start liveness window |
//! | `LODESTAR_ORPHAN_POLICY` | No | `reject` | `reject` or `register` |
//! | `LODESTAR_ECHO` | No | `false` | Echo workload traffic back |
//! | `LODESTAR_FOLLOW_LOGS` | No | `true` | Follow workload logs |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`tree`]: Component tree model and loader
//! - [`registry`]: Name-keyed component registry
//! - [`comm`]: Per-component communication handler
//! - [`container`]: Container runtime capability and backends
//! - [`lifecycle`]: Workload convergence
//! - [`matcher`]: Connection matching and the accept loop
//! - [`runtime`]: Embeddable orchestrator runtime
//! - [`error`]: Error types

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for orchestrator operations.
pub mod error;

/// Component tree model and JSON loader.
pub mod tree;

/// Component registry with per-component locking.
pub mod registry;

/// Communication handler owning a component's connection.
pub mod comm;

/// Container runtime capability (Docker, mock).
pub mod container;

/// Workload lifecycle state machine.
pub mod lifecycle;

/// Connection matcher and accept loop.
pub mod matcher;

/// Embeddable runtime for running lodestar inside another application.
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::OrchestratorRuntime;
