// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection matcher.
//!
//! Every accepted connection is traced back to the workload holding the peer's
//! address, and through the workload's name to a component. The connection is
//! then attached to that component's communication handler.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use lodestar_protocol::{EnvelopeCodec, ProstCodec};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::comm::{CommError, HandlerConfig};
use crate::container::{ContainerRuntime, RuntimeError};
use crate::registry::{ComponentState, Registry};

/// What to do with a connection no workload claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Close the connection
    #[default]
    Reject,
    /// Keep it under an `orphan@<peer ip>` registry entry
    Register,
}

impl OrphanPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Register => "register",
        }
    }
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "register" => Ok(Self::Register),
            other => Err(format!("unknown orphan policy: {}", other)),
        }
    }
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an accepted connection was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Attached to a component backed by a known workload
    Attached {
        component: String,
        generation: u64,
        /// The component was not registered before this connection
        new_component: bool,
    },
    /// Attached to an orphan entry
    Orphaned { component: String, generation: u64 },
    /// Closed because no workload claims the peer
    Rejected { peer: SocketAddr },
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("cannot resolve peer {peer}: {source}")]
    Lookup {
        peer: SocketAddr,
        #[source]
        source: RuntimeError,
    },

    #[error("cannot attach connection to {component}: {source}")]
    Attach {
        component: String,
        #[source]
        source: CommError,
    },
}

/// Registry key of the orphan entry for a peer.
pub fn orphan_key(peer: &SocketAddr) -> String {
    format!("orphan@{}", peer.ip())
}

/// Resolves accepted connections to components.
pub struct ConnectionMatcher {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    handler_config: HandlerConfig,
    codec: Arc<dyn EnvelopeCodec>,
    orphan_policy: OrphanPolicy,
}

impl ConnectionMatcher {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        handler_config: HandlerConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            handler_config,
            codec: Arc::new(ProstCodec),
            orphan_policy: OrphanPolicy::default(),
        }
    }

    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn orphan_policy(&self) -> OrphanPolicy {
        self.orphan_policy
    }

    /// Resolve `peer` and attach `stream` to the matching component.
    ///
    /// A stream that is not attached is shut down before it is dropped.
    pub async fn handle_connection<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
    ) -> Result<MatchOutcome, MatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let workload = match self.runtime.workload_by_address(peer.ip()).await {
            Ok(workload) => workload,
            Err(source) => {
                let _ = stream.shutdown().await;
                return Err(MatchError::Lookup { peer, source });
            }
        };

        let Some(workload) = workload else {
            return self.handle_unknown(stream, peer).await;
        };

        let name = workload.name.clone();
        let (component, new_component) = self
            .registry
            .find_or_insert(&name, || ComponentState::discovered(name.clone()))
            .await;
        if new_component {
            info!(component = %name, peer = %peer, "Registered component discovered from connection");
        }
        if component.record_workload_id_if_absent(&workload.id).await {
            debug!(component = %name, workload_id = %workload.id, "Recorded workload id from connection");
        }

        let generation = component
            .attach_connection(stream, &self.handler_config, self.codec.clone())
            .await
            .map_err(|source| MatchError::Attach {
                component: name.clone(),
                source,
            })?;

        info!(component = %name, peer = %peer, generation, "Matched connection");
        Ok(MatchOutcome::Attached {
            component: name,
            generation,
            new_component,
        })
    }

    async fn handle_unknown<S>(&self, mut stream: S, peer: SocketAddr) -> Result<MatchOutcome, MatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.orphan_policy {
            OrphanPolicy::Reject => {
                warn!(peer = %peer, "No workload holds the peer address, closing connection");
                let _ = stream.shutdown().await;
                Ok(MatchOutcome::Rejected { peer })
            }
            OrphanPolicy::Register => {
                let key = orphan_key(&peer);
                let (component, _) = self
                    .registry
                    .find_or_insert(&key, || ComponentState::orphan(key.clone()))
                    .await;

                let generation = component
                    .attach_connection(stream, &self.handler_config, self.codec.clone())
                    .await
                    .map_err(|source| MatchError::Attach {
                        component: key.clone(),
                        source,
                    })?;

                warn!(component = %key, peer = %peer, generation, "Attached unmatched connection to orphan entry");
                Ok(MatchOutcome::Orphaned {
                    component: key,
                    generation,
                })
            }
        }
    }
}

/// Accept connections until `shutdown_rx` turns true, matching each one on
/// its own task.
pub async fn run_listener(
    listener: TcpListener,
    matcher: Arc<ConnectionMatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, policy = %matcher.orphan_policy(), "Connection matcher listening");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Connection matcher received shutdown signal");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let matcher = matcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = matcher.handle_connection(stream, peer).await {
                                error!(peer = %peer, error = %e, "Failed to match connection");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }

    info!(addr = %local_addr, "Connection matcher stopped");
    Ok(())
}
