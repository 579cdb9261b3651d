//! Wire types for the Management Plane RPCs: node/user/plan CRUD,
//! traffic/metrics queries, batch operations, global config, pagination.

use crate::node_plane::{MetricsSnapshot, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `{page, page_size, total}` pagination envelope. `page`/`page_size`
/// default to 1/20 when zero or negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
}

impl PageRequest {
    pub const DEFAULT_PAGE: i64 = 1;
    pub const DEFAULT_PAGE_SIZE: i64 = 20;

    /// Normalizes non-positive values to the defaults.
    pub fn normalize(&self) -> (i64, i64) {
        let page = if self.page > 0 { self.page } else { Self::DEFAULT_PAGE };
        let page_size = if self.page_size > 0 { self.page_size } else { Self::DEFAULT_PAGE_SIZE };
        (page, page_size)
    }

    pub fn offset(&self) -> i64 {
        let (page, page_size) = self.normalize();
        (page - 1) * page_size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metrics: Option<MetricsSnapshot>,
    pub cumulative_upload: i64,
    pub cumulative_download: i64,
    pub current_users: i32,
    pub max_users: i32,
    pub config_version: i64,
    pub sing_box_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodeConfigRequest {
    pub node_id: String,
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_users: Option<i32>,
    pub status: Option<NodeStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
    Expired,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Suspended => "suspended",
            UserStatus::Expired => "expired",
            UserStatus::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for UserStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UserStatus::Active),
            "suspended" => Ok(UserStatus::Suspended),
            "expired" => Ok(UserStatus::Expired),
            "disabled" => Ok(UserStatus::Disabled),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub status: UserStatus,
    pub plan_id: Option<String>,
    pub traffic_quota: i64,
    pub traffic_used: i64,
    pub traffic_reset_at: Option<DateTime<Utc>>,
    pub device_limit: i32,
    pub speed_limit_mbps: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub login_attempts: i32,
    pub subscription_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub plan_id: Option<String>,
    pub traffic_quota: Option<i64>,
    pub device_limit: Option<i32>,
    pub speed_limit_mbps: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub plan_id: Option<String>,
    pub status: Option<UserStatus>,
    pub traffic_quota: Option<i64>,
    pub device_limit: Option<i32>,
    pub speed_limit_mbps: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    pub plan_id: String,
    pub name: String,
    pub period_days: i32,
    pub price_cents: i64,
    pub traffic_quota: i64,
    pub device_limit: i32,
    pub speed_limit_mbps: i32,
    pub connection_limit: i32,
    pub enabled: bool,
    pub current_users: i32,
    pub max_users: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchOp {
    Enable,
    Disable,
    Delete,
    ResetTraffic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUserOperationRequest {
    pub user_ids: Vec<String>,
    pub op: BatchOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResultStatus {
    Ok,
    NotFound,
    QueueFull,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubResult {
    pub user_id: String,
    pub status: SubResultStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUserOperationResponse {
    pub success: bool,
    pub results: Vec<BatchSubResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub page: PageRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecordView {
    pub user_id: String,
    pub node_id: String,
    pub upload: i64,
    pub download: i64,
    pub total: i64,
    pub connect_time: DateTime<Utc>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemOverview {
    pub total_nodes: i64,
    pub online_nodes: i64,
    pub total_users: i64,
    pub active_users: i64,
    pub traffic_today_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfigEntry {
    pub key: String,
    pub value: String,
}
