use caramba_shared::node_plane::NodeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable row backing a managed node. The in-memory `NodeSessionState`
/// (Registry, `caramba-panel::registry`) is the authoritative *live* view;
/// this row is what persists across restarts and what the Reaper leaves
/// behind when it evicts a node from the Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub status: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub load1: Option<f64>,
    pub load5: Option<f64>,
    pub load15: Option<f64>,
    pub in_bps: Option<f64>,
    pub out_bps: Option<f64>,
    pub active_connections: Option<i32>,
    pub cumulative_upload: i64,
    pub cumulative_download: i64,
    pub current_users: i32,
    pub max_users: i32,
    pub config_version: i64,
    pub sing_box_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn status(&self) -> NodeStatus {
        self.status.parse().unwrap_or(NodeStatus::Error)
    }
}
