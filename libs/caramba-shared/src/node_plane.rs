//! Wire types for the Agent Plane RPCs: RegisterNode, Heartbeat,
//! ReportMetrics, ReportTraffic, UpdateConfig, ExecuteUserCommand,
//! RestartSingBox, GetNodeStatus.

use crate::command::PendingCommand;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
    Disabled,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Disabled => "disabled",
            NodeStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "maintenance" => Ok(NodeStatus::Maintenance),
            "disabled" => Ok(NodeStatus::Disabled),
            "error" => Ok(NodeStatus::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub load1: Option<f64>,
    pub load5: Option<f64>,
    pub load15: Option<f64>,
    pub in_bps: Option<f64>,
    pub out_bps: Option<f64>,
    pub active_connections: Option<u32>,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub capability: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub pending_commands: Vec<PendingCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetricsRequest {
    pub node_id: String,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetricsResponse {
    pub success: bool,
}

/// One user's traffic delta since the node's last `ReportTraffic` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTrafficEntry {
    pub user_id: String,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub session_id: Option<String>,
    pub connect_time: Option<DateTime<Utc>>,
    pub disconnect_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTrafficRequest {
    pub node_id: String,
    pub entries: Vec<UserTrafficEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTrafficResponse {
    pub success: bool,
    /// user_ids for which a quota-exceeded side signal fired.
    #[serde(default)]
    pub quota_exceeded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodeStatusResponse {
    pub status: NodeStatus,
    pub metrics: Option<MetricsSnapshot>,
    pub config_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSingBoxRequest {
    pub node_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSingBoxResponse {
    pub success: bool,
}

/// Agent pulls its current declarative config after receiving an
/// `APPLY_CONFIG` pending command (or periodically as a cheap idempotent
/// poll — the config hash makes repeated pulls cheap to no-op on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigResponse {
    pub config_version: i64,
    pub hash: String,
    pub content: serde_json::Value,
}

/// Lets the agent resolve the authoritative, full state for a user named in
/// a `PendingCommand`'s (intentionally minimal) parameter map, before
/// applying the command locally. The command queue itself never carries
/// more than an opaque reference — this is the resolve step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteUserCommandRequest {
    pub node_id: String,
    pub command_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteUserCommandResponse {
    pub success: bool,
    /// Present unless the user has since been deleted (not an error — the
    /// command executor treats an absent user as an implicit REMOVE_USER).
    pub user: Option<serde_json::Value>,
}
