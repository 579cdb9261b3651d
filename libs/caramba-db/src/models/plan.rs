use serde::{Deserialize, Serialize};

/// Durable row backing a subscription plan. `current_users` is a
/// best-effort derived counter, recomputed on demand rather than maintained
/// transactionally alongside every user mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub name: String,
    pub period_days: i32,
    pub price_cents: i64,
    pub traffic_quota: i64,
    pub device_limit: i32,
    pub speed_limit_mbps: i32,
    pub connection_limit: i32,
    pub enabled: bool,
    pub max_users: i32,
    pub features: serde_json::Value,
}
