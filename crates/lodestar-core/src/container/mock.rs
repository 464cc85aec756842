// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container runtime for testing.
//!
//! Keeps workloads and networks in memory, counts every call and can be told
//! to fail specific operations. Nothing is ever executed.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use super::traits::*;

/// Operations whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    List,
    Create,
    Start,
    Wait,
    Stop,
    Remove,
    JoinNetwork,
    EnsureNetwork,
    StreamLogs,
}

/// Number of calls per operation since creation (or the last reset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub list: usize,
    pub create: usize,
    pub start: usize,
    pub wait: usize,
    pub stop: usize,
    pub remove: usize,
    pub join_network: usize,
    pub ensure_network: usize,
    pub stream_logs: usize,
}

impl MockCalls {
    /// Calls that change workload state.
    pub fn mutations(&self) -> usize {
        self.create + self.start + self.stop + self.remove + self.join_network
    }
}

#[derive(Debug, Clone)]
struct MockWorkload {
    summary: WorkloadSummary,
    image: String,
}

#[derive(Default)]
struct MockState {
    workloads: Vec<MockWorkload>,
    networks: HashMap<String, String>,
    calls: MockCalls,
    failing: HashSet<MockOperation>,
    crash_on_start: HashSet<String>,
    logs: HashMap<String, Vec<LogChunk>>,
    next_id: u64,
    next_host: u8,
}

impl MockState {
    fn check(&self, op: MockOperation) -> Result<()> {
        if self.failing.contains(&op) {
            Err(RuntimeError::Api(format!("mock {:?} failure", op)))
        } else {
            Ok(())
        }
    }

    fn by_id_mut(&mut self, id: &str) -> Result<&mut MockWorkload> {
        self.workloads
            .iter_mut()
            .find(|w| w.summary.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn by_name_mut(&mut self, name: &str) -> Option<&mut MockWorkload> {
        self.workloads.iter_mut().find(|w| w.summary.name == name)
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("mock-{:012x}", self.next_id)
    }

    fn allocate_ip(&mut self) -> IpAddr {
        self.next_host = self.next_host.wrapping_add(1).max(2);
        IpAddr::V4(Ipv4Addr::new(10, 88, 0, self.next_host))
    }
}

/// In-memory container runtime for tests.
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    changed: Arc<Notify>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create an empty mock runtime.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Create a mock runtime where `op` always fails.
    pub fn failing(op: MockOperation) -> Self {
        let mut state = MockState::default();
        state.failing.insert(op);
        Self {
            state: Arc::new(Mutex::new(state)),
            changed: Arc::new(Notify::new()),
        }
    }

    pub async fn fail_on(&self, op: MockOperation) {
        self.state.lock().await.failing.insert(op);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    /// Insert a workload as if it had been created by an earlier run.
    ///
    /// Does not count as a call. Returns the workload id.
    pub async fn seed_workload(
        &self,
        name: &str,
        image: &str,
        labels: HashMap<String, String>,
        status: WorkloadStatus,
    ) -> String {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.workloads.push(MockWorkload {
            summary: WorkloadSummary {
                id: id.clone(),
                name: name.to_string(),
                labels,
                status,
                networks: Vec::new(),
            },
            image: image.to_string(),
        });
        id
    }

    /// Change a workload's status, waking anyone waiting on it.
    pub async fn set_status(&self, name: &str, status: WorkloadStatus) {
        let mut state = self.state.lock().await;
        if let Some(workload) = state.by_name_mut(name) {
            workload.summary.status = status;
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Give the named workload an address, as if the runtime had assigned it.
    pub async fn assign_address(&self, name: &str, ip: IpAddr) {
        let mut state = self.state.lock().await;
        if let Some(workload) = state.by_name_mut(name) {
            match workload.summary.networks.first_mut() {
                Some(attachment) => attachment.ip_address = Some(ip),
                None => workload.summary.networks.push(NetworkAttachment {
                    network_id: "bridge".to_string(),
                    network_name: "bridge".to_string(),
                    ip_address: Some(ip),
                }),
            }
        }
    }

    /// Make the named workload exit immediately whenever it is started.
    pub async fn crash_on_start(&self, name: &str) {
        self.state
            .lock()
            .await
            .crash_on_start
            .insert(name.to_string());
    }

    /// Output returned by `stream_logs` for the named workload.
    pub async fn set_logs(&self, name: &str, lines: &[(LogSource, &str)]) {
        let chunks = lines
            .iter()
            .map(|(source, line)| LogChunk {
                source: *source,
                message: Bytes::copy_from_slice(line.as_bytes()),
            })
            .collect();
        self.state
            .lock()
            .await
            .logs
            .insert(name.to_string(), chunks);
    }

    pub async fn calls(&self) -> MockCalls {
        self.state.lock().await.calls
    }

    pub async fn reset_calls(&self) {
        self.state.lock().await.calls = MockCalls::default();
    }

    pub async fn workload(&self, name: &str) -> Option<WorkloadSummary> {
        let state = self.state.lock().await;
        state
            .workloads
            .iter()
            .find(|w| w.summary.name == name)
            .map(|w| w.summary.clone())
    }

    /// Image the named workload was created from.
    pub async fn image_of(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .workloads
            .iter()
            .find(|w| w.summary.name == name)
            .map(|w| w.image.clone())
    }

    pub async fn network_id(&self, name: &str) -> Option<String> {
        self.state.lock().await.networks.get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>> {
        let mut state = self.state.lock().await;
        state.calls.list += 1;
        state.check(MockOperation::List)?;
        Ok(state.workloads.iter().map(|w| w.summary.clone()).collect())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String> {
        let mut state = self.state.lock().await;
        state.calls.create += 1;
        state.check(MockOperation::Create)?;

        if state.by_name_mut(&spec.name).is_some() {
            return Err(RuntimeError::Conflict(format!(
                "workload name {} already in use",
                spec.name
            )));
        }

        let id = state.allocate_id();
        state.workloads.push(MockWorkload {
            summary: WorkloadSummary {
                id: id.clone(),
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                status: WorkloadStatus::Created,
                networks: Vec::new(),
            },
            image: spec.image.clone(),
        });
        Ok(id)
    }

    async fn start_workload(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.start += 1;
        state.check(MockOperation::Start)?;

        let crashing = state.crash_on_start.clone();
        let workload = state.by_id_mut(id)?;
        workload.summary.status = if crashing.contains(&workload.summary.name) {
            WorkloadStatus::Exited
        } else {
            WorkloadStatus::Running
        };
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn wait_not_running(&self, id: &str) -> Result<WorkloadStatus> {
        {
            let mut state = self.state.lock().await;
            state.calls.wait += 1;
            state.check(MockOperation::Wait)?;
        }

        loop {
            // Register before checking so a change between the check and the
            // await is not missed.
            let notified = self.changed.notified();
            {
                let mut state = self.state.lock().await;
                let status = state.by_id_mut(id)?.summary.status;
                if !status.is_running() {
                    return Ok(status);
                }
            }
            notified.await;
        }
    }

    async fn stop_workload(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.stop += 1;
        state.check(MockOperation::Stop)?;

        let workload = state.by_id_mut(id)?;
        if workload.summary.status.is_running() {
            workload.summary.status = WorkloadStatus::Exited;
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn remove_workload(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.remove += 1;
        state.check(MockOperation::Remove)?;

        let index = state
            .workloads
            .iter()
            .position(|w| w.summary.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        if state.workloads[index].summary.status.is_running() && !force {
            return Err(RuntimeError::Conflict(format!(
                "workload {} is running; stop it or force removal",
                id
            )));
        }

        state.workloads.remove(index);
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn join_network(&self, id: &str, network_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.join_network += 1;
        state.check(MockOperation::JoinNetwork)?;

        let network_name = state
            .networks
            .iter()
            .find(|(_, nid)| nid.as_str() == network_id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("network {}", network_id)))?;

        if state.by_id_mut(id)?.summary.is_attached_to(network_id) {
            return Ok(());
        }

        let ip = state.allocate_ip();
        state.by_id_mut(id)?.summary.networks.push(NetworkAttachment {
            network_id: network_id.to_string(),
            network_name,
            ip_address: Some(ip),
        });
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.calls.ensure_network += 1;
        state.check(MockOperation::EnsureNetwork)?;

        if let Some(id) = state.networks.get(name) {
            return Ok(id.clone());
        }

        let id = format!("mocknet-{}", state.networks.len() + 1);
        state.networks.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        let mut state = self.state.lock().await;
        state.calls.stream_logs += 1;
        state.check(MockOperation::StreamLogs)?;

        let name = state.by_id_mut(id)?.summary.name.clone();
        let chunks = state.logs.get(&name).cloned().unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn spec(name: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: name.to_string(),
            image: format!("acme/{}:1", name),
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_start_list() {
        let runtime = MockRuntime::new();

        let id = runtime.create_workload(&spec("worker")).await.unwrap();
        assert_eq!(
            runtime.workload("worker").await.unwrap().status,
            WorkloadStatus::Created
        );

        runtime.start_workload(&id).await.unwrap();
        let listed = runtime.list_workloads().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].status, WorkloadStatus::Running);
        assert_eq!(runtime.image_of("worker").await.as_deref(), Some("acme/worker:1"));

        let calls = runtime.calls().await;
        assert_eq!(calls.create, 1);
        assert_eq!(calls.start, 1);
        assert_eq!(calls.list, 1);
        assert_eq!(calls.mutations(), 2);
    }

    #[tokio::test]
    async fn test_create_name_conflict() {
        let runtime = MockRuntime::new();
        runtime.create_workload(&spec("worker")).await.unwrap();

        let result = runtime.create_workload(&spec("worker")).await;
        assert!(matches!(result, Err(RuntimeError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let runtime = MockRuntime::new();
        let id = runtime.create_workload(&spec("worker")).await.unwrap();
        runtime.start_workload(&id).await.unwrap();

        assert!(matches!(
            runtime.remove_workload(&id, false).await,
            Err(RuntimeError::Conflict(_))
        ));
        runtime.remove_workload(&id, true).await.unwrap();
        assert!(runtime.workload("worker").await.is_none());

        assert!(matches!(
            runtime.remove_workload(&id, true).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_not_running_resolves_on_stop() {
        let runtime = Arc::new(MockRuntime::new());
        let id = runtime.create_workload(&spec("worker")).await.unwrap();
        runtime.start_workload(&id).await.unwrap();

        let waiter = {
            let runtime = runtime.clone();
            let id = id.clone();
            tokio::spawn(async move { runtime.wait_not_running(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        runtime
            .stop_workload(&id, Duration::from_secs(1))
            .await
            .unwrap();
        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status, WorkloadStatus::Exited);
    }

    #[tokio::test]
    async fn test_crash_on_start() {
        let runtime = MockRuntime::new();
        runtime.crash_on_start("flaky").await;
        let id = runtime.create_workload(&spec("flaky")).await.unwrap();

        runtime.start_workload(&id).await.unwrap();
        assert_eq!(
            runtime.wait_not_running(&id).await.unwrap(),
            WorkloadStatus::Exited
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let runtime = MockRuntime::failing(MockOperation::Create);
        assert!(matches!(
            runtime.create_workload(&spec("worker")).await,
            Err(RuntimeError::Api(_))
        ));
        assert_eq!(runtime.calls().await.create, 1);

        runtime.clear_failures().await;
        runtime.create_workload(&spec("worker")).await.unwrap();

        runtime.fail_on(MockOperation::List).await;
        assert!(runtime.find_workload("worker").await.is_err());
    }

    #[tokio::test]
    async fn test_network_join_assigns_address() {
        let runtime = MockRuntime::new();
        let net = runtime.ensure_network("lodestar-net").await.unwrap();
        assert_eq!(runtime.ensure_network("lodestar-net").await.unwrap(), net);

        let id = runtime.create_workload(&spec("worker")).await.unwrap();
        runtime.join_network(&id, &net).await.unwrap();
        runtime.join_network(&id, &net).await.unwrap();

        let summary = runtime.workload("worker").await.unwrap();
        assert_eq!(summary.networks.len(), 1);
        assert_eq!(summary.networks[0].network_name, "lodestar-net");
        let ip = summary.networks[0].ip_address.unwrap();

        let found = runtime.workload_by_address(ip).await.unwrap().unwrap();
        assert_eq!(found.name, "worker");

        assert!(matches!(
            runtime.join_network(&id, "missing-net").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_assign_address_and_lookup() {
        let runtime = MockRuntime::new();
        runtime
            .seed_workload("worker", "acme/worker:1", HashMap::new(), WorkloadStatus::Running)
            .await;
        runtime
            .assign_address("worker", "127.0.0.1".parse().unwrap())
            .await;

        let found = runtime
            .workload_by_address("127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(found.map(|w| w.name), Some("worker".to_string()));

        let none = runtime
            .workload_by_address("127.0.0.2".parse().unwrap())
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_stream_logs() {
        let runtime = MockRuntime::new();
        let id = runtime.create_workload(&spec("worker")).await.unwrap();
        runtime
            .set_logs(
                "worker",
                &[(LogSource::Stdout, "booted"), (LogSource::Stderr, "warning")],
            )
            .await;

        let chunks: Vec<_> = runtime
            .stream_logs(&id)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, LogSource::Stdout);
        assert_eq!(&chunks[1].message[..], b"warning");
    }
}
