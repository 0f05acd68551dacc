//! In-memory control plane and observer used by unit tests.

use crate::control::ControlPlane;
use crate::error::ControlError;
use crate::events::{SessionEvent, SessionObserver};
use crate::model::{Node, NodeLogs, NodeStatus, SpeedTestResult, StatusResponse};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

pub fn node(id: &str, country: &str, status: NodeStatus) -> Node {
    Node {
        id: id.to_string(),
        country: country.to_string(),
        status,
        server: None,
        tailscale_hostname: None,
        tailscale_ip: None,
        started_at: None,
        health_status: None,
        metrics: None,
    }
}

/// Behaves like a control plane that applies every request immediately.
///
/// `hold_*` makes the matching calls park until a `release_*` hands out a permit.
pub struct FakeControlPlane {
    nodes: Mutex<Vec<Node>>,
    list_error: Mutex<Option<ControlError>>,
    start_error: Mutex<Option<ControlError>>,
    stop_error: Mutex<Option<ControlError>>,
    restart_error: Mutex<Option<ControlError>>,
    list_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    restart_calls: AtomicUsize,
    hold_list: AtomicBool,
    hold_mutations: AtomicBool,
    list_gate: Semaphore,
    mutation_gate: Semaphore,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
            list_error: Mutex::new(None),
            start_error: Mutex::new(None),
            stop_error: Mutex::new(None),
            restart_error: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            restart_calls: AtomicUsize::new(0),
            hold_list: AtomicBool::new(false),
            hold_mutations: AtomicBool::new(false),
            list_gate: Semaphore::new(0),
            mutation_gate: Semaphore::new(0),
        }
    }
}

impl FakeControlPlane {
    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        let fake = Self::default();
        *fake.nodes.lock().unwrap() = nodes;
        fake
    }

    pub fn fail_list(&self, err: ControlError) {
        *self.list_error.lock().unwrap() = Some(err);
    }

    pub fn clear_list_failure(&self) {
        *self.list_error.lock().unwrap() = None;
    }

    pub fn fail_start(&self, err: ControlError) {
        *self.start_error.lock().unwrap() = Some(err);
    }

    pub fn fail_stop(&self, err: ControlError) {
        *self.stop_error.lock().unwrap() = Some(err);
    }

    pub fn fail_restart(&self, err: ControlError) {
        *self.restart_error.lock().unwrap() = Some(err);
    }

    pub fn hold_list(&self) {
        self.hold_list.store(true, Ordering::SeqCst);
    }

    pub fn release_list(&self) {
        self.list_gate.add_permits(1);
    }

    pub fn hold_mutations(&self) {
        self.hold_mutations.store(true, Ordering::SeqCst);
    }

    pub fn release_mutations(&self) {
        self.mutation_gate.add_permits(1);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn restart_calls(&self) -> usize {
        self.restart_calls.load(Ordering::SeqCst)
    }

    async fn pass(&self, held: &AtomicBool, gate: &Semaphore) {
        if held.load(Ordering::SeqCst) {
            gate.acquire().await.expect("gate open").forget();
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_nodes(&self) -> Result<Vec<Node>, ControlError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&self.hold_list, &self.list_gate).await;
        if let Some(err) = self.list_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn start_node(
        &self,
        country: &str,
        server: Option<&str>,
    ) -> Result<Node, ControlError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&self.hold_mutations, &self.mutation_gate).await;
        if let Some(err) = self.start_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut started = node(&format!("vpn-{}", country), country, NodeStatus::Starting);
        started.server = server.map(str::to_string);
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|existing| existing.country != country);
        let mut running = started.clone();
        running.status = NodeStatus::Running;
        nodes.push(running);
        Ok(started)
    }

    async fn stop_node(&self, node_id: &str) -> Result<StatusResponse, ControlError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&self.hold_mutations, &self.mutation_gate).await;
        if let Some(err) = self.stop_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut nodes = self.nodes.lock().unwrap();
        let before = nodes.len();
        nodes.retain(|existing| existing.id != node_id);
        if nodes.len() == before {
            return Err(ControlError::Api {
                status: 404,
                message: "Node not found".to_string(),
            });
        }
        Ok(StatusResponse {
            status: "stopped".to_string(),
        })
    }

    async fn restart_node(&self, node_id: &str) -> Result<StatusResponse, ControlError> {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(&self.hold_mutations, &self.mutation_gate).await;
        if let Some(err) = self.restart_error.lock().unwrap().clone() {
            return Err(err);
        }
        let known = self.nodes.lock().unwrap().iter().any(|n| n.id == node_id);
        if !known {
            return Err(ControlError::Api {
                status: 404,
                message: "Node not found".to_string(),
            });
        }
        Ok(StatusResponse {
            status: "restarted".to_string(),
        })
    }

    async fn node_details(&self, node_id: &str) -> Result<Node, ControlError> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.id == node_id)
            .cloned()
            .ok_or(ControlError::Api {
                status: 404,
                message: "Node not found".to_string(),
            })
    }

    async fn node_logs(&self, _node_id: &str, lines: u32) -> Result<NodeLogs, ControlError> {
        Ok(NodeLogs {
            logs: "connected".to_string(),
            lines: lines.min(1),
        })
    }

    async fn available_countries(&self) -> Result<Vec<String>, ControlError> {
        Ok(["us", "de", "jp", "ie", "uk"]
            .iter()
            .map(|c| c.to_string())
            .collect())
    }

    async fn run_speed_test(&self, node_id: &str) -> Result<SpeedTestResult, ControlError> {
        Ok(SpeedTestResult {
            node_id: Some(node_id.to_string()),
            download_mbps: 94.2,
            upload_mbps: 41.0,
            latency_ms: 18.0,
            tested_at: "2026-10-19T10:00:00Z".to_string(),
        })
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn successes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Success { title, .. } => Some(title),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Failure { title, .. } => Some(title),
                _ => None,
            })
            .collect()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_event(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
