// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime capability - workload execution backends.

#[cfg(feature = "docker")]
pub mod docker;
pub mod mock;
mod traits;

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use mock::{MockCalls, MockOperation, MockRuntime};
pub use traits::*;
