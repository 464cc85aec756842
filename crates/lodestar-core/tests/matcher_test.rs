// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection matcher tests over loopback TCP.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use lodestar_core::comm::HandlerConfig;
use lodestar_core::container::{MockOperation, MockRuntime, WorkloadStatus};
use lodestar_core::matcher::{
    ConnectionMatcher, MatchError, MatchOutcome, OrphanPolicy, orphan_key, run_listener,
};
use lodestar_core::registry::Registry;
use lodestar_protocol::frame::{FrameError, read_frame};
use lodestar_protocol::{Envelope, WorkloadClient, WorkloadClientConfig};
use tokio::io::duplex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Harness {
    runtime: Arc<MockRuntime>,
    registry: Arc<Registry>,
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    listener: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(policy: OrphanPolicy) -> Self {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(Registry::build(&worker_tree()).unwrap());
        Self::start_with(runtime, registry, policy).await
    }

    async fn start_with(
        runtime: Arc<MockRuntime>,
        registry: Arc<Registry>,
        policy: OrphanPolicy,
    ) -> Self {
        let matcher = Arc::new(
            ConnectionMatcher::new(
                registry.clone(),
                runtime.clone(),
                HandlerConfig {
                    channel_capacity: 16,
                    ..Default::default()
                },
            )
            .with_orphan_policy(policy),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(run_listener(listener, matcher, shutdown_rx));

        Self {
            runtime,
            registry,
            addr,
            shutdown_tx,
            listener,
        }
    }

    /// Make the loopback address belong to a running workload called `name`.
    async fn claim_loopback(&self, name: &str) -> String {
        let id = self
            .runtime
            .seed_workload(
                name,
                "acme/worker:1",
                version_labels(RUN_VERSION),
                WorkloadStatus::Running,
            )
            .await;
        self.runtime.assign_address(name, LOOPBACK).await;
        id
    }

    async fn client(&self) -> WorkloadClient {
        WorkloadClient::connect(WorkloadClientConfig {
            core_addr: self.addr.to_string(),
            connect_attempts: 3,
            retry_delay: Duration::from_millis(50),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    async fn wait_for_generation(&self, component: &str, generation: u64) {
        let registry = &*self.registry;
        eventually("connection attached", move || async move {
            match registry.find(component).await {
                Some(state) => state
                    .comm_handler()
                    .await
                    .is_some_and(|h| h.generation() == generation && h.is_connected()),
                None => false,
            }
        })
        .await;
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.listener.await.unwrap().unwrap();
        self.registry.shutdown_handlers().await;
    }
}

// ========== Known Workloads ==========

#[tokio::test]
async fn test_connection_is_matched_to_component() {
    let harness = Harness::start(OrphanPolicy::Reject).await;
    let workload_id = harness.claim_loopback("worker").await;

    let mut client = harness.client().await;
    harness.wait_for_generation("worker", 1).await;

    let worker = harness.registry.find("worker").await.unwrap();
    assert_eq!(worker.workload_id().await, Some(workload_id));

    let handler = worker.comm_handler().await.unwrap();
    let mut to_core = handler.take_to_core_receiver().await.unwrap();

    let envelope = Envelope::new(1, "svc.worker", Bytes::from_static(b"up"));
    client.send(&envelope).await.unwrap();
    let received = recv_within(&mut to_core).await;
    assert!(!received.is_empty());
    assert_eq!(handler.recent_envelope(), Some(envelope));

    let reply = Envelope::new(2, "core", Bytes::from_static(b"ack"));
    handler.send_envelope(&reply).await.unwrap();
    let got = tokio::time::timeout(WAIT, client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Some(reply));

    harness.stop().await;
}

#[tokio::test]
async fn test_reconnect_reuses_handler_and_queue() {
    let harness = Harness::start(OrphanPolicy::Reject).await;
    harness.claim_loopback("worker").await;

    let mut first = harness.client().await;
    harness.wait_for_generation("worker", 1).await;
    let worker = harness.registry.find("worker").await.unwrap();
    let handler = worker.comm_handler().await.unwrap();

    first.disconnect().await.unwrap();
    let handler_ref = &handler;
    eventually("disconnect observed", move || async move {
        !handler_ref.is_connected()
    })
    .await;

    handler
        .send_to_workload(Bytes::from_static(b"while away"))
        .await
        .unwrap();

    let mut second = harness.client().await;
    harness.wait_for_generation("worker", 2).await;

    assert!(Arc::ptr_eq(&handler, &worker.comm_handler().await.unwrap()));
    let raw = tokio::time::timeout(WAIT, second.recv_raw())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw.as_deref(), Some(&b"while away"[..]));

    harness.stop().await;
}

#[tokio::test]
async fn test_workload_unknown_to_tree_is_registered() {
    let harness = Harness::start(OrphanPolicy::Reject).await;
    let workload_id = harness.claim_loopback("extra").await;

    let _client = harness.client().await;
    harness.wait_for_generation("extra", 1).await;

    let extra = harness.registry.find("extra").await.unwrap();
    assert!(!extra.is_orphan());
    assert!(!extra.is_managed());
    assert_eq!(extra.workload_id().await, Some(workload_id));
    assert_eq!(harness.registry.len().await, 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_recorded_workload_id_is_kept() {
    let harness = Harness::start(OrphanPolicy::Reject).await;
    harness.claim_loopback("worker").await;
    let worker = harness.registry.find("worker").await.unwrap();
    worker.set_workload_id(Some("already-known".to_string())).await;

    let _client = harness.client().await;
    harness.wait_for_generation("worker", 1).await;

    assert_eq!(worker.workload_id().await.as_deref(), Some("already-known"));

    harness.stop().await;
}

// ========== Unknown Peers ==========

#[tokio::test]
async fn test_unknown_peer_is_rejected_and_closed() {
    let harness = Harness::start(OrphanPolicy::Reject).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let result = tokio::time::timeout(WAIT, read_frame(&mut stream, 1024))
        .await
        .unwrap();

    assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    assert_eq!(harness.registry.names().await, vec!["worker"]);

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_peer_is_registered_as_orphan() {
    let harness = Harness::start(OrphanPolicy::Register).await;
    let key = orphan_key(&SocketAddr::new(LOOPBACK, 0));

    let mut first = harness.client().await;
    harness.wait_for_generation(&key, 1).await;

    let orphan = harness.registry.find(&key).await.unwrap();
    assert!(orphan.is_orphan());
    assert!(orphan.workload_id().await.is_none());

    first.disconnect().await.unwrap();
    let _second = harness.client().await;
    harness.wait_for_generation(&key, 2).await;

    assert_eq!(harness.registry.len().await, 2);

    harness.stop().await;
}

// ========== Direct Matching ==========

#[tokio::test]
async fn test_handle_connection_reports_outcomes() {
    let runtime = Arc::new(MockRuntime::new());
    let registry = Arc::new(Registry::build(&worker_tree()).unwrap());
    runtime
        .seed_workload(
            "worker",
            "acme/worker:1",
            version_labels(RUN_VERSION),
            WorkloadStatus::Running,
        )
        .await;
    runtime
        .assign_address("worker", "10.0.0.2".parse().unwrap())
        .await;

    let matcher = ConnectionMatcher::new(registry.clone(), runtime.clone(), HandlerConfig::default());

    let (stream, _peer) = duplex(1024);
    let outcome = matcher
        .handle_connection(stream, "10.0.0.2:41000".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        MatchOutcome::Attached {
            component: "worker".to_string(),
            generation: 1,
            new_component: false,
        }
    );

    let (stream, _peer) = duplex(1024);
    let peer: SocketAddr = "10.0.0.9:41000".parse().unwrap();
    let outcome = matcher.handle_connection(stream, peer).await.unwrap();
    assert_eq!(outcome, MatchOutcome::Rejected { peer });

    let matcher = matcher.with_orphan_policy(OrphanPolicy::Register);
    let (stream, _peer) = duplex(1024);
    let outcome = matcher.handle_connection(stream, peer).await.unwrap();
    assert_eq!(
        outcome,
        MatchOutcome::Orphaned {
            component: "orphan@10.0.0.9".to_string(),
            generation: 1,
        }
    );

    registry.shutdown_handlers().await;
}

#[tokio::test]
async fn test_lookup_failure_closes_connection() {
    let runtime = Arc::new(MockRuntime::failing(MockOperation::List));
    let registry = Arc::new(Registry::build(&worker_tree()).unwrap());
    let matcher = ConnectionMatcher::new(registry.clone(), runtime, HandlerConfig::default());

    let (stream, mut peer) = duplex(1024);
    let result = matcher
        .handle_connection(stream, "10.0.0.2:41000".parse().unwrap())
        .await;

    assert!(matches!(result, Err(MatchError::Lookup { .. })));
    assert!(matches!(
        read_frame(&mut peer, 1024).await,
        Err(FrameError::ConnectionClosed)
    ));
    assert!(registry.find("worker").await.unwrap().comm_handler().await.is_none());
}

#[tokio::test]
async fn test_listener_stops_on_shutdown() {
    let harness = Harness::start(OrphanPolicy::Reject).await;
    let addr = harness.addr;

    harness.stop().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
