// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Component registry.
//!
//! The registry maps component names to [`ComponentState`]s. Two levels of
//! locking keep unrelated components independent:
//!
//! - the registry's map lock only guards membership (lookup and insertion);
//! - each component's own lock guards its workload id and its handler.
//!
//! The map lock is never held while a component is being mutated.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use lodestar_protocol::EnvelopeCodec;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::comm::{CommError, CommHandler, HandlerConfig};
use crate::tree::{ComponentNode, FlatComponent, flatten, load_component_tree};

/// Errors while building the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate component name: {0}")]
    DuplicateComponentName(String),
}

#[derive(Default)]
struct ComponentInner {
    workload_id: Option<String>,
    comm_handler: Option<Arc<CommHandler>>,
}

/// Runtime state of one component.
pub struct ComponentState {
    name: String,
    group: String,
    workload_ref: String,
    external_id: String,
    path: Option<String>,
    orphan: bool,
    inner: RwLock<ComponentInner>,
    /// Serializes convergence of this component
    converge: Mutex<()>,
}

impl ComponentState {
    fn with_descriptor(
        name: String,
        group: String,
        workload_ref: String,
        external_id: String,
        path: Option<String>,
        orphan: bool,
    ) -> Self {
        Self {
            name,
            group,
            workload_ref,
            external_id,
            path,
            orphan,
            inner: RwLock::new(ComponentInner::default()),
            converge: Mutex::new(()),
        }
    }

    pub fn from_flat(component: FlatComponent) -> Self {
        Self::with_descriptor(
            component.name,
            component.group,
            component.workload_ref,
            component.external_id,
            component.path,
            false,
        )
    }

    /// Entry for a connection whose peer no workload claims.
    pub fn orphan(name: impl Into<String>) -> Self {
        Self::with_descriptor(name.into(), String::new(), String::new(), String::new(), None, true)
    }

    /// Entry for a workload the runtime knows but the tree does not.
    pub fn discovered(name: impl Into<String>) -> Self {
        Self::with_descriptor(name.into(), String::new(), String::new(), String::new(), None, false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn workload_ref(&self) -> &str {
        &self.workload_ref
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_orphan(&self) -> bool {
        self.orphan
    }

    /// Whether the lifecycle manager can provision this component.
    pub fn is_managed(&self) -> bool {
        !self.orphan && !self.workload_ref.is_empty()
    }

    pub async fn workload_id(&self) -> Option<String> {
        self.inner.read().await.workload_id.clone()
    }

    pub async fn set_workload_id(&self, id: Option<String>) {
        self.inner.write().await.workload_id = id;
    }

    /// Record `id` unless an id is already known. Returns whether it was recorded.
    pub async fn record_workload_id_if_absent(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.workload_id.is_some() {
            return false;
        }
        inner.workload_id = Some(id.to_string());
        true
    }

    pub async fn comm_handler(&self) -> Option<Arc<CommHandler>> {
        self.inner.read().await.comm_handler.clone()
    }

    /// Attach a connection to this component's handler, creating the handler
    /// on first use. A reconnect reuses the existing handler and its queues.
    ///
    /// Returns the handler's connection generation.
    pub async fn attach_connection<S>(
        &self,
        stream: S,
        config: &HandlerConfig,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Result<u64, CommError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut inner = self.inner.write().await;

        let handler = match &inner.comm_handler {
            Some(handler) if !handler.is_shut_down() => handler.clone(),
            _ => {
                debug!(component = %self.name, "Creating communication handler");
                let handler = Arc::new(CommHandler::new(self.name.clone(), config.clone(), codec));
                inner.comm_handler = Some(handler.clone());
                handler
            }
        };

        handler.attach(stream).await
    }

    /// Shut down and drop the handler. Returns whether there was one.
    pub async fn discard_handler(&self) -> bool {
        let handler = self.inner.write().await.comm_handler.take();
        match handler {
            Some(handler) => {
                handler.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Hold this guard while converging the component's workload.
    pub(crate) async fn begin_convergence(&self) -> MutexGuard<'_, ()> {
        self.converge.lock().await
    }
}

impl std::fmt::Debug for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentState")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("workload_ref", &self.workload_ref)
            .field("orphan", &self.orphan)
            .finish_non_exhaustive()
    }
}

/// Name-keyed map of every component this orchestrator knows.
#[derive(Default)]
pub struct Registry {
    components: RwLock<HashMap<String, Arc<ComponentState>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from every leaf of `root`.
    pub fn build(root: &ComponentNode) -> Result<Self, RegistryError> {
        let components = flatten(root);
        let count = components.len();
        let registry = Self::from_components(components)?;
        info!(components = count, root = %root.name, "Registry built");
        Ok(registry)
    }

    /// Load the component tree file at `path` and build a registry from it.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let tree = load_component_tree(path)?;
        Ok(Self::build(&tree)?)
    }

    pub fn from_components(
        components: impl IntoIterator<Item = FlatComponent>,
    ) -> Result<Self, RegistryError> {
        let mut map = HashMap::new();
        for component in components {
            if map.contains_key(&component.name) {
                return Err(RegistryError::DuplicateComponentName(component.name));
            }
            map.insert(
                component.name.clone(),
                Arc::new(ComponentState::from_flat(component)),
            );
        }
        Ok(Self {
            components: RwLock::new(map),
        })
    }

    pub async fn find(&self, name: &str) -> Option<Arc<ComponentState>> {
        self.components.read().await.get(name).cloned()
    }

    /// Return the component called `name`, inserting `factory()` when absent.
    ///
    /// The boolean is true when this call inserted the entry. Concurrent
    /// callers for the same name all observe the same instance.
    pub async fn find_or_insert<F>(&self, name: &str, factory: F) -> (Arc<ComponentState>, bool)
    where
        F: FnOnce() -> ComponentState,
    {
        if let Some(existing) = self.components.read().await.get(name) {
            return (existing.clone(), false);
        }

        let mut components = self.components.write().await;
        if let Some(existing) = components.get(name) {
            return (existing.clone(), false);
        }

        let state = Arc::new(factory());
        components.insert(name.to_string(), state.clone());
        debug!(component = %name, orphan = state.is_orphan(), "Registered component");
        (state, true)
    }

    /// Snapshot of registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of registered components, sorted by name.
    pub async fn components(&self) -> Vec<Arc<ComponentState>> {
        let mut components: Vec<_> = self.components.read().await.values().cloned().collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));
        components
    }

    pub async fn len(&self) -> usize {
        self.components.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.components.read().await.is_empty()
    }

    /// Shut down every component's handler. Returns how many were shut down.
    pub async fn shutdown_handlers(&self) -> usize {
        let mut count = 0;
        for component in self.components().await {
            if component.discard_handler().await {
                count += 1;
            }
        }
        count
    }
}
