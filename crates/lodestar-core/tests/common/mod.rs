// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for lodestar-core integration tests.
//!
//! Provides TestContext wiring a registry and a lifecycle manager to an
//! in-memory container runtime.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lodestar_core::container::MockRuntime;
use lodestar_core::lifecycle::{LifecycleConfig, LifecycleManager, RUN_VERSION_LABEL};
use lodestar_core::registry::Registry;
use lodestar_core::tree::ComponentNode;
use tokio::sync::mpsc;

/// Run version used by test contexts.
pub const RUN_VERSION: &str = "v1";

/// How long helpers wait for something to happen before giving up.
pub const WAIT: Duration = Duration::from_secs(5);

/// Registry, lifecycle manager and mock runtime for one test.
pub struct TestContext {
    pub runtime: Arc<MockRuntime>,
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleManager>,
}

impl TestContext {
    pub fn new(tree: &ComponentNode) -> Self {
        Self::with_config(tree, test_lifecycle_config(RUN_VERSION))
    }

    pub fn with_config(tree: &ComponentNode, config: LifecycleConfig) -> Self {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(Registry::build(tree).expect("tree has unique names"));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            runtime.clone(),
            config,
        ));
        Self {
            runtime,
            registry,
            lifecycle,
        }
    }
}

/// Lifecycle settings with a short startup grace and no log following.
pub fn test_lifecycle_config(run_version: &str) -> LifecycleConfig {
    LifecycleConfig {
        startup_grace: Duration::from_millis(20),
        follow_logs: false,
        stop_timeout: Duration::from_secs(1),
        ..LifecycleConfig::new(run_version)
    }
}

/// `svc -> [worker]`
pub fn worker_tree() -> ComponentNode {
    ComponentNode::branch(
        "svc",
        vec![ComponentNode::leaf("worker", "acme/worker:1", "w-1")],
    )
}

/// `svc -> [worker, data -> [store]]`
pub fn fleet_tree() -> ComponentNode {
    ComponentNode::branch(
        "svc",
        vec![
            ComponentNode::leaf("worker", "acme/worker:1", "w-1"),
            ComponentNode::branch(
                "data",
                vec![ComponentNode::leaf("store", "acme/store:1", "s-1")],
            ),
        ],
    )
}

/// Labels of a workload created for `run_version`.
pub fn version_labels(run_version: &str) -> HashMap<String, String> {
    HashMap::from([(RUN_VERSION_LABEL.to_string(), run_version.to_string())])
}

/// Receive from `rx`, failing the test after [`WAIT`].
pub async fn recv_within<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

/// Poll `check` until it returns true, failing the test after [`WAIT`].
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}
