use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Stopped,
    Error,
    Starting,
    Stopping,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Running => "running",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Error => "error",
            NodeStatus::Starting => "starting",
            NodeStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_mb: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub connected_clients: u32,
    #[serde(default)]
    pub vpn_connected: bool,
    #[serde(default)]
    pub last_health_check: Option<String>,
}

/// A remote exit node as reported by the control plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub country: String,
    pub status: NodeStatus,
    #[serde(default, rename = "vpn_server")]
    pub server: Option<String>,
    #[serde(default)]
    pub tailscale_hostname: Option<String>,
    #[serde(default)]
    pub tailscale_ip: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub health_status: Option<HealthStatus>,
    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
}

impl Node {
    pub fn is_running(&self) -> bool {
        self.status == NodeStatus::Running
    }

    /// Time since `started_at`, if the control plane sent a parseable timestamp.
    pub fn uptime(&self, now: OffsetDateTime) -> Option<time::Duration> {
        let started = self.started_at.as_deref()?;
        let started = OffsetDateTime::parse(started, &Rfc3339).ok()?;
        Some(now - started)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartNodeRequest {
    pub server: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeLogs {
    pub logs: String,
    pub lines: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    WeightedLatency,
    Random,
    HealthScore,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::WeightedLatency => "weighted_latency",
            Strategy::Random => "random",
            Strategy::HealthScore => "health_score",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerStrategy {
    pub strategy: Strategy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpeedTestResult {
    #[serde(default)]
    pub node_id: Option<String>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub tested_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_nodes: u32,
    pub active_nodes: u32,
    pub total_traffic: u64,
    pub connected_clients: u32,
}

/// Structured error body returned by the control plane on failure.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub flag: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Active,
    Inactive,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub country: String,
    pub http_proxy: String,
    pub https_proxy: String,
    pub socks5_proxy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub status: EndpointStatus,
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{} B", bytes)
    } else if value < KB * KB {
        format!("{:.1} KB", value / KB)
    } else if value < KB * KB * KB {
        format!("{:.1} MB", value / (KB * KB))
    } else {
        format!("{:.1} GB", value / (KB * KB * KB))
    }
}

pub fn format_uptime(uptime: Option<time::Duration>) -> String {
    match uptime {
        Some(uptime) => {
            let minutes = uptime.whole_minutes().max(0);
            format!("{}h {}m", minutes / 60, minutes % 60)
        }
        None => "Unknown".to_string(),
    }
}
