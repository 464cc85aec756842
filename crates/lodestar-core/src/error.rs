// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for lodestar-core.

use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Component tree could not be loaded.
    #[error("Component tree error: {0}")]
    Tree(#[from] crate::tree::TreeError),

    /// Registry could not be built.
    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    /// Container runtime call failed.
    #[error("Container runtime error: {0}")]
    Runtime(#[from] crate::container::RuntimeError),

    /// Component convergence failed.
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    /// Communication handler refused the operation.
    #[error("Communication error: {0}")]
    Comm(#[from] crate::comm::CommError),

    /// Connection could not be matched to a component.
    #[error("Connection matching error: {0}")]
    Match(#[from] crate::matcher::MatchError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Orchestrator runtime failed to start or stop.
    #[error(transparent)]
    Startup(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error must stop the process at startup.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Tree(_) | Self::Registry(_)
        )
    }

    /// Process exit status for an error that ends the orchestrator.
    ///
    /// Fatal startup errors map to `EX_CONFIG` (78), everything else to 1.
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal_at_startup() {
            EXIT_CONFIG
        } else {
            1
        }
    }
}

/// `EX_CONFIG` from sysexits.h.
pub const EXIT_CONFIG: u8 = 78;

/// Result type using the orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;
